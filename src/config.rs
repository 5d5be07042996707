use clap::Parser;
use std::path::PathBuf;

/// Pagewatch: synthetic monitoring for uploaded browser E2E tests and
/// first-party domains.
#[derive(Parser, Debug, Clone)]
#[command(name = "pagewatch")]
pub struct CliArgs {
    /// Data directory (SQLite store, source blobs, artifacts)
    #[arg(short = 'd', long = "data-dir", default_value = "/data/pagewatch")]
    pub data_dir: PathBuf,

    /// Listening address for the registry API
    #[arg(long = "listen", default_value = "0.0.0.0:8111")]
    pub listen: String,

    /// Number of runner workers
    #[arg(long = "workers", default_value_t = DEFAULT_RUNNER_WORKERS)]
    pub workers: usize,

    /// Domain monitor config file (JSON). Omit to disable the domain monitor.
    #[arg(long = "domains-file")]
    pub domains_file: Option<PathBuf>,

    /// Headless browser executable (falls back to $CHROMIUM_PATH)
    #[arg(long = "chromium-path")]
    pub chromium_path: Option<String>,
}

// Scheduling constants
pub const SCHEDULER_TICK_SECS: u64 = 1;
pub const DEFAULT_RUNNER_WORKERS: usize = 4;
pub const WORKER_IDLE_SLEEP_MS: u64 = 500;
pub const RUN_TIMEOUT_GRACE_SECS: u64 = 5;
pub const KILL_WAIT_TIMEOUT_SECS: u64 = 5;
pub const SHUTDOWN_GRACE_SECS: u64 = 15;

// Backoff: fail streaks at or past these thresholds stretch the interval.
pub const BACKOFF_FAIL_STREAK: i64 = 10;
pub const BACKOFF_FAIL_STREAK_MAX: i64 = 20;
pub const BACKOFF_FACTOR: f64 = 2.0;
pub const BACKOFF_FACTOR_MAX: f64 = 4.0;

// Registry validation bounds
pub const MIN_INTERVAL_SECONDS: i64 = 60;
pub const MAX_INTERVAL_SECONDS: i64 = 3600;
pub const MIN_TIMEOUT_SECONDS: i64 = 1;
pub const MAX_TIMEOUT_SECONDS: i64 = 300;
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

// Alerting
pub const ALERT_CHUNK_MAX_CHARS: usize = 4096;

// Retention
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 24 * 3600;

// Domain monitor
pub const DOMAIN_PROBE_CONCURRENCY: usize = 2;

// Escalation circuit breaker: stop calling a failing dispatcher for a
// cooldown window, and tell the operator at most once per notice interval.
pub const DISPATCH_BREAKER_FAILURES: u32 = 3;
pub const DISPATCH_BREAKER_COOLDOWN_SECS: u64 = 30 * 60;
pub const DISPATCH_BREAKER_NOTICE_INTERVAL_SECS: u64 = 3600;

// Host health sweep
pub const HOST_HEALTH_INTERVAL_SECS: u64 = 60;
pub const HOST_DOWN_AFTER_FAILURES: i64 = 3;
pub const HOST_UP_AFTER_SUCCESSES: i64 = 2;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_i64(name: &str, default: i64) -> i64 {
    env_str(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_str(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

/// Resource limits for the host health sweep. A reading over its limit is
/// a violation; violations debounce through the state engine like any
/// other failing subject.
#[derive(Debug, Clone)]
pub struct HostThresholds {
    pub mem_used_max_percent: f64,
    pub swap_used_max_percent: f64,
    pub disk_used_max_percent: f64,
    pub load_per_cpu_max: f64,
    pub cpu_used_max_percent: f64,
}

/// Resolved runtime configuration. Loaded once at startup and treated as
/// read-only afterwards.
pub struct WatchConfig {
    pub data_dir: PathBuf,
    pub listen: String,
    pub workers: usize,
    pub domains_file: Option<PathBuf>,
    pub chromium_path: Option<String>,

    // Token scopes. Tenant API keys live in the store; these two are
    // deployment-level secrets.
    pub admin_token: String,
    pub monitor_token: String,

    // Concurrency quotas enforced at enqueue time.
    pub global_concurrency: i64,
    pub per_tenant_concurrency: i64,

    // Alert transport (chat API). Empty token disables alerting.
    pub alerts_enabled: bool,
    pub chat_bot_token: String,
    pub chat_id: String,

    // Escalation dispatcher.
    pub dispatch_enabled: bool,
    pub dispatch_base_url: String,
    pub dispatch_token: String,
    pub dispatch_model: String,
    pub dispatch_poll_seconds: u64,
    pub dispatch_max_wait_seconds: u64,

    // Heartbeat summaries.
    pub heartbeat_times: Vec<String>,
    pub heartbeat_timezone: String,

    // Used to build evidence links in alerts.
    pub public_base_url: String,

    // Retention windows.
    pub run_retention_days: i64,
    pub artifact_retention_days: i64,

    // Host resource monitoring (opt-in; reads Linux /proc).
    pub host_health_enabled: bool,
    pub host_thresholds: HostThresholds,

    // Sandbox interpreters.
    pub python_bin: String,
    pub node_bin: String,
}

impl WatchConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let heartbeat_times = env_str("PAGEWATCH_HEARTBEAT_TIMES")
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        WatchConfig {
            data_dir: args.data_dir,
            listen: args.listen,
            workers: args.workers.max(1),
            domains_file: args.domains_file,
            chromium_path: args.chromium_path.or_else(|| env_str("CHROMIUM_PATH")),

            admin_token: env_str("PAGEWATCH_ADMIN_TOKEN").unwrap_or_default(),
            monitor_token: env_str("PAGEWATCH_MONITOR_TOKEN").unwrap_or_default(),

            global_concurrency: env_i64("PAGEWATCH_GLOBAL_CONCURRENCY", 8).max(1),
            per_tenant_concurrency: env_i64("PAGEWATCH_TENANT_CONCURRENCY", 2).max(1),

            alerts_enabled: env_bool("PAGEWATCH_ALERTS_ENABLED", true),
            chat_bot_token: env_str("PAGEWATCH_CHAT_BOT_TOKEN").unwrap_or_default(),
            chat_id: env_str("PAGEWATCH_CHAT_ID").unwrap_or_default(),

            dispatch_enabled: env_bool("PAGEWATCH_DISPATCH_ENABLED", false),
            dispatch_base_url: env_str("PAGEWATCH_DISPATCH_BASE_URL").unwrap_or_default(),
            dispatch_token: env_str("PAGEWATCH_DISPATCH_TOKEN").unwrap_or_default(),
            dispatch_model: env_str("PAGEWATCH_DISPATCH_MODEL").unwrap_or_default(),
            dispatch_poll_seconds: env_i64("PAGEWATCH_DISPATCH_POLL_SECONDS", 5).max(1) as u64,
            dispatch_max_wait_seconds: env_i64("PAGEWATCH_DISPATCH_MAX_WAIT_SECONDS", 2 * 3600)
                .max(60) as u64,

            heartbeat_times,
            heartbeat_timezone: env_str("PAGEWATCH_HEARTBEAT_TZ")
                .unwrap_or_else(|| "UTC".to_string()),

            public_base_url: env_str("PAGEWATCH_PUBLIC_BASE_URL").unwrap_or_default(),

            run_retention_days: env_i64("PAGEWATCH_RUN_RETENTION_DAYS", 90).max(1),
            artifact_retention_days: env_i64("PAGEWATCH_ARTIFACT_RETENTION_DAYS", 14).max(1),

            host_health_enabled: env_bool("PAGEWATCH_HOST_HEALTH_ENABLED", false),
            host_thresholds: HostThresholds {
                mem_used_max_percent: env_f64("PAGEWATCH_HOST_MEM_MAX_PERCENT", 90.0),
                swap_used_max_percent: env_f64("PAGEWATCH_HOST_SWAP_MAX_PERCENT", 80.0),
                disk_used_max_percent: env_f64("PAGEWATCH_HOST_DISK_MAX_PERCENT", 90.0),
                load_per_cpu_max: env_f64("PAGEWATCH_HOST_LOAD_PER_CPU_MAX", 3.0),
                cpu_used_max_percent: env_f64("PAGEWATCH_HOST_CPU_MAX_PERCENT", 95.0),
            },

            python_bin: env_str("PAGEWATCH_PYTHON_BIN").unwrap_or_else(|| "python3".to_string()),
            node_bin: env_str("PAGEWATCH_NODE_BIN").unwrap_or_else(|| "node".to_string()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("store.db")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.data_dir.join("sources")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.data_dir.join("sandbox")
    }
}
