use serde::{Deserialize, Serialize};

/// How an uploaded test is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    ScriptPython,
    ScriptJs,
}

impl TestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::ScriptPython => "script_python",
            TestKind::ScriptJs => "script_js",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script_python" => Some(TestKind::ScriptPython),
            "script_js" => Some(TestKind::ScriptJs),
            _ => None,
        }
    }

    /// Required file extension for uploaded sources of this kind.
    pub fn extension(self) -> &'static str {
        match self {
            TestKind::ScriptPython => "py",
            TestKind::ScriptJs => "js",
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Fail,
    InfraDegraded,
    Timeout,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
            RunStatus::InfraDegraded => "infra_degraded",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pass" => Some(RunStatus::Pass),
            "fail" => Some(RunStatus::Fail),
            "infra_degraded" => Some(RunStatus::InfraDegraded),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }
}

/// Debounced observed state of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveOk {
    Unknown,
    Up,
    Down,
}

impl EffectiveOk {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectiveOk::Unknown => "unknown",
            EffectiveOk::Up => "up",
            EffectiveOk::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "up" => EffectiveOk::Up,
            "down" => EffectiveOk::Down,
            _ => EffectiveOk::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Test,
    Domain,
    Host,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Test => "test",
            SubjectKind::Domain => "domain",
            SubjectKind::Host => "host",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "domain" => SubjectKind::Domain,
            "host" => SubjectKind::Host,
            _ => SubjectKind::Test,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub created_at_ts: f64,
}

/// Tenant scope resolved from a presented bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedTenant {
    pub tenant_id: String,
    pub api_key_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Test {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub base_url: String,
    pub kind: TestKind,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub disabled_until_ts: Option<f64>,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub jitter_seconds: i64,
    pub down_after_failures: i64,
    pub up_after_successes: i64,
    pub notify_on_recovery: bool,
    pub dispatch_on_failure: bool,
    pub source_relpath: String,
    pub source_filename: String,
    pub source_sha256: String,
    pub created_at_ts: f64,
    pub updated_at_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectState {
    pub subject_id: String,
    pub kind: SubjectKind,
    pub effective_ok: EffectiveOk,
    pub fail_streak: i64,
    pub success_streak: i64,
    pub last_ok_ts: Option<f64>,
    pub last_fail_ts: Option<f64>,
    pub last_infra_ts: Option<f64>,
    pub last_alert_ts: Option<f64>,
    pub next_due_ts: Option<f64>,
    pub last_elapsed_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub test_id: String,
    pub scheduled_for_ts: f64,
    pub started_at_ts: Option<f64>,
    pub finished_at_ts: Option<f64>,
    pub status: RunStatus,
    pub elapsed_ms: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub artifacts: serde_json::Map<String, serde_json::Value>,
}

/// Fields the runner writes back when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub started_at_ts: f64,
    pub finished_at_ts: f64,
    pub elapsed_ms: Option<f64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub final_url: Option<String>,
    pub title: Option<String>,
    pub artifacts: serde_json::Map<String, serde_json::Value>,
}

pub(crate) fn artifacts_from_json(raw: &str) -> serde_json::Map<String, serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}
