use serde::Deserialize;

use crate::store::RunStatus;

pub const RESULT_PREFIX: &str = "E2E_RESULT_JSON=";

/// Error-message substrings that indicate the browser/runtime fell over
/// rather than the target site misbehaving. Matched case-insensitively over
/// whatever error text the child reported.
pub const BROWSER_INFRA_SENTINELS: &[&str] = &[
    "target closed",
    "target crashed",
    "browser disconnected",
    "session closed",
    "page crashed",
    "navigation failed because browser has disconnected",
];

pub fn is_browser_infra_error(message: &str) -> bool {
    let low = message.to_ascii_lowercase();
    BROWSER_INFRA_SENTINELS.iter().any(|s| low.contains(s))
}

/// The single machine-readable line a sandbox child prints on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxResult {
    pub status: String,
    #[serde(default)]
    pub elapsed_ms: Option<f64>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artifacts: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub browser_infra_error: bool,
}

impl SandboxResult {
    /// Declared status, reclassified through the infra sentinel matcher.
    /// The child's own `browser_infra_error` flag and the controller-side
    /// substring match both promote a fail to infra_degraded.
    pub fn effective_status(&self) -> RunStatus {
        let declared = RunStatus::parse(&self.status).unwrap_or(RunStatus::Fail);
        if declared == RunStatus::Pass {
            return RunStatus::Pass;
        }
        let infra_by_message = self
            .error_message
            .as_deref()
            .map(is_browser_infra_error)
            .unwrap_or(false);
        if self.browser_infra_error || infra_by_message {
            RunStatus::InfraDegraded
        } else {
            declared
        }
    }
}

/// Scan combined child output for the last result line. Children may log
/// freely; only the final `E2E_RESULT_JSON=` line is the contract.
pub fn extract_result(output: &str) -> Option<SandboxResult> {
    let mut last: Option<&str> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(RESULT_PREFIX) {
            if rest.starts_with('{') {
                last = Some(rest);
            }
        }
    }
    serde_json::from_str(last?).ok()
}
