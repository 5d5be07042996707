use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{
    HostThresholds, HOST_DOWN_AFTER_FAILURES, HOST_HEALTH_INTERVAL_SECS, HOST_UP_AFTER_SUCCESSES,
};
use crate::engine::{self, Observation, SubjectMeta};
use crate::state::SharedState;
use crate::store::{now_ts, RunStatus, SubjectKind};

pub const HOST_SUBJECT_ID: &str = "host";

/// One sweep's worth of host resource readings. Any reading that could not
/// be taken (non-Linux, missing /proc entry) is None and is simply not
/// judged, so a partial snapshot degrades to fewer checks, never to noise.
#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    pub mem_used_percent: Option<f64>,
    pub swap_used_percent: Option<f64>,
    pub disk_used_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub cpu_count: usize,
    pub cpu_used_percent: Option<f64>,
}

fn meminfo_value_kb(content: &str, key: &str) -> Option<u64> {
    for line in content.lines() {
        let Some(rest) = line.strip_prefix(key) else {
            continue;
        };
        let rest = rest.trim_start_matches(':').trim();
        return rest.split_whitespace().next()?.parse().ok();
    }
    None
}

fn read_memory() -> (Option<f64>, Option<f64>) {
    let Ok(content) = std::fs::read_to_string("/proc/meminfo") else {
        return (None, None);
    };
    let mem = match (
        meminfo_value_kb(&content, "MemTotal"),
        meminfo_value_kb(&content, "MemAvailable"),
    ) {
        (Some(total), Some(avail)) if total > 0 => {
            Some((total.saturating_sub(avail)) as f64 / total as f64 * 100.0)
        }
        _ => None,
    };
    let swap = match (
        meminfo_value_kb(&content, "SwapTotal"),
        meminfo_value_kb(&content, "SwapFree"),
    ) {
        (Some(total), Some(free)) if total > 0 => {
            Some((total.saturating_sub(free)) as f64 / total as f64 * 100.0)
        }
        _ => None,
    };
    (mem, swap)
}

fn read_load_1m() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// (total jiffies, idle jiffies) from the aggregate cpu line of /proc/stat.
fn read_cpu_total_idle() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields[4];
    Some((total, idle))
}

/// CPU utilisation between two /proc/stat samples.
pub fn cpu_used_percent(prev: (u64, u64), cur: (u64, u64)) -> Option<f64> {
    let total = cur.0.checked_sub(prev.0)?;
    let idle = cur.1.checked_sub(prev.1)?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(idle)) as f64 / total as f64 * 100.0)
}

/// Filesystem usage for the data directory, via `df -P` (the portable
/// output format). None when df is unavailable or the path is not mounted.
async fn read_disk_used_percent(path: &Path) -> Option<f64> {
    let output = tokio::process::Command::new("df")
        .arg("-P")
        .arg(path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().nth(1)?;
    let pct = line.split_whitespace().nth(4)?;
    pct.trim_end_matches('%').parse().ok()
}

/// Judge a snapshot against the configured limits. Each breach is one
/// human-readable line; the full list becomes the failure message.
pub fn violations(snap: &HostSnapshot, limits: &HostThresholds) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(v) = snap.mem_used_percent {
        if v > limits.mem_used_max_percent {
            out.push(format!(
                "memory {:.0}% used (limit {:.0}%)",
                v, limits.mem_used_max_percent
            ));
        }
    }
    if let Some(v) = snap.swap_used_percent {
        if v > limits.swap_used_max_percent {
            out.push(format!(
                "swap {:.0}% used (limit {:.0}%)",
                v, limits.swap_used_max_percent
            ));
        }
    }
    if let Some(v) = snap.disk_used_percent {
        if v > limits.disk_used_max_percent {
            out.push(format!(
                "disk {:.0}% used (limit {:.0}%)",
                v, limits.disk_used_max_percent
            ));
        }
    }
    if let Some(load) = snap.load_1m {
        if snap.cpu_count > 0 {
            let per_cpu = load / snap.cpu_count as f64;
            if per_cpu > limits.load_per_cpu_max {
                out.push(format!(
                    "load {:.2} over {} cpus (limit {:.2}/cpu)",
                    load, snap.cpu_count, limits.load_per_cpu_max
                ));
            }
        }
    }
    if let Some(v) = snap.cpu_used_percent {
        if v > limits.cpu_used_max_percent {
            out.push(format!(
                "cpu {:.0}% used (limit {:.0}%)",
                v, limits.cpu_used_max_percent
            ));
        }
    }
    out
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "host".to_string())
}

/// Host resource sweep: one subject ("host") fed through the same debounce
/// engine as tests and domains, so resource exhaustion alerts flap-protect
/// and recover exactly like any other DOWN/UP signal. Opt-in; the readings
/// come from Linux /proc and df.
pub fn spawn_host_health(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !state.config.host_health_enabled {
            return;
        }
        if let Err(e) = state
            .store
            .ensure_state(HOST_SUBJECT_ID, SubjectKind::Host, now_ts())
        {
            error!("Failed to create host state row: {}", e);
            return;
        }
        let meta = SubjectMeta {
            subject_id: HOST_SUBJECT_ID.to_string(),
            kind: SubjectKind::Host,
            display_name: hostname(),
            base_url: String::new(),
            down_after_failures: HOST_DOWN_AFTER_FAILURES,
            up_after_successes: HOST_UP_AFTER_SUCCESSES,
            notify_on_recovery: true,
            dispatch_on_failure: false,
        };
        info!("Host health monitor started ({})", meta.display_name);

        let mut shutdown = state.shutdown_requested();
        let mut prev_cpu = read_cpu_total_idle();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(HOST_HEALTH_INTERVAL_SECS)) => {}
                _ = shutdown.recv() => return,
            }

            let cur_cpu = read_cpu_total_idle();
            let (mem, swap) = read_memory();
            let snap = HostSnapshot {
                mem_used_percent: mem,
                swap_used_percent: swap,
                disk_used_percent: read_disk_used_percent(&state.config.data_dir).await,
                load_1m: read_load_1m(),
                cpu_count: std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
                cpu_used_percent: match (prev_cpu, cur_cpu) {
                    (Some(p), Some(c)) => cpu_used_percent(p, c),
                    _ => None,
                },
            };
            prev_cpu = cur_cpu;

            let problems = violations(&snap, &state.config.host_thresholds);
            let obs = if problems.is_empty() {
                Observation {
                    status: RunStatus::Pass,
                    elapsed_ms: None,
                    run_id: None,
                    error_kind: None,
                    error_message: None,
                }
            } else {
                warn!("Host health violations: {}", problems.join("; "));
                Observation {
                    status: RunStatus::Fail,
                    elapsed_ms: None,
                    run_id: None,
                    error_kind: Some("host_resources".to_string()),
                    error_message: Some(problems.join("; ")),
                }
            };
            engine::observe(&state, &meta, &obs).await;
        }
    })
}
