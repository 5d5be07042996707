use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{
    DISPATCH_BREAKER_COOLDOWN_SECS, DISPATCH_BREAKER_FAILURES,
    DISPATCH_BREAKER_NOTICE_INTERVAL_SECS,
};

/// Operational rules embedded verbatim in every escalation prompt. The
/// investigation agent gets read access only.
pub const READ_ONLY_RULES: &str = "IMPORTANT safety rules:\n\
- The agent must not mutate the target.\n\
- The agent must not authenticate with real credentials.\n\
- The agent must not perform writes.\n\
- The agent must produce only investigative observations.\n";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub base_url: String,
    pub token: String,
    pub model: String,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

/// Circuit breaker for the escalation endpoint. Repeated failures open the
/// breaker for a cooldown window so a dead or misconfigured dispatcher is
/// not hammered on every DOWN transition; it closes again once the window
/// passes. Operator notices about the trip are rate-limited separately.
#[derive(Debug, Default)]
pub struct DispatchBreaker {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
    last_notice: Option<Instant>,
}

impl DispatchBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when escalations may be attempted. Clears the disabled window
    /// (and the failure count) once the cooldown has passed.
    pub fn is_available(&mut self, now: Instant) -> bool {
        match self.disabled_until {
            Some(until) if now < until => false,
            Some(_) => {
                self.disabled_until = None;
                self.consecutive_failures = 0;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.disabled_until = None;
    }

    /// Returns true when this failure trips the breaker open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DISPATCH_BREAKER_FAILURES && self.disabled_until.is_none() {
            self.disabled_until = Some(now + Duration::from_secs(DISPATCH_BREAKER_COOLDOWN_SECS));
            return true;
        }
        false
    }

    /// Rate-limits "dispatcher disabled" notices to one per interval.
    pub fn should_notify(&mut self, now: Instant) -> bool {
        match self.last_notice {
            Some(last)
                if now.duration_since(last).as_secs() < DISPATCH_BREAKER_NOTICE_INTERVAL_SECS =>
            {
                false
            }
            _ => {
                self.last_notice = Some(now);
                true
            }
        }
    }
}

/// Client for the external escalation service: create a job, poll it to a
/// terminal state, fetch the agent's final text.
pub struct DispatchClient {
    client: reqwest::Client,
    cfg: DispatchConfig,
    breaker: Mutex<DispatchBreaker>,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    done: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub job_id: String,
    pub status: String,
    pub output: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("timed out waiting for dispatch job {0}")]
    Timeout(String),
}

impl DispatchClient {
    pub fn new(client: reqwest::Client, cfg: DispatchConfig) -> Self {
        Self {
            client,
            cfg,
            breaker: Mutex::new(DispatchBreaker::new()),
        }
    }

    pub fn available(&self) -> bool {
        self.breaker.lock().unwrap().is_available(Instant::now())
    }

    pub fn record_success(&self) {
        self.breaker.lock().unwrap().record_success();
    }

    /// Returns true when this failure tripped the breaker open.
    pub fn record_failure(&self) -> bool {
        self.breaker.lock().unwrap().record_failure(Instant::now())
    }

    pub fn should_notify(&self) -> bool {
        self.breaker.lock().unwrap().should_notify(Instant::now())
    }

    pub fn cooldown_minutes() -> u64 {
        DISPATCH_BREAKER_COOLDOWN_SECS / 60
    }

    pub async fn create_job(&self, prompt: &str) -> Result<String, DispatchError> {
        let url = format!("{}/api/jobs", self.cfg.base_url.trim_end_matches('/'));
        let mut payload = serde_json::json!({ "prompt": prompt });
        if !self.cfg.model.is_empty() {
            payload["model"] = serde_json::Value::String(self.cfg.model.clone());
        }
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.token)
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        let body: CreateJobResponse = resp.json().await?;
        info!("Dispatch job created: {}", body.job_id);
        Ok(body.job_id)
    }

    pub async fn poll(&self, job_id: &str) -> Result<JobStatus, DispatchError> {
        let url = format!(
            "{}/api/jobs/{}",
            self.cfg.base_url.trim_end_matches('/'),
            job_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.cfg.token)
            .timeout(Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()?;
        let body: JobStatusResponse = resp.json().await?;
        Ok(JobStatus {
            done: body.done,
            status: body.status.unwrap_or_else(|| {
                if body.done { "done".to_string() } else { "running".to_string() }
            }),
            output: body.output,
        })
    }

    /// Create a job and poll until terminal or the configured deadline.
    pub async fn run_to_completion(&self, prompt: &str) -> Result<DispatchOutcome, DispatchError> {
        let job_id = self.create_job(prompt).await?;
        let deadline = tokio::time::Instant::now() + self.cfg.max_wait;

        loop {
            tokio::time::sleep(self.cfg.poll_interval).await;
            match self.poll(&job_id).await {
                Ok(status) if status.done => {
                    return Ok(DispatchOutcome {
                        job_id,
                        status: status.status,
                        output: status.output,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("Dispatch poll error for {}: {}", job_id, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DispatchError::Timeout(job_id));
            }
        }
    }
}

#[derive(Debug)]
pub struct JobStatus {
    pub done: bool,
    pub status: String,
    pub output: Option<String>,
}

/// Investigation prompt for a subject that just transitioned DOWN.
pub fn build_failure_prompt(
    subject_kind: &str,
    subject_name: &str,
    base_url: &str,
    run_id: Option<&str>,
    error_kind: Option<&str>,
    error_message: Option<&str>,
) -> String {
    let details = serde_json::json!({
        "subject_kind": subject_kind,
        "subject": subject_name,
        "base_url": base_url,
        "run_id": run_id,
        "error_kind": error_kind,
        "error_message": error_message,
    });
    format!(
        "A synthetic monitoring check is failing and has crossed its debounce threshold.\n\n\
         Failure details (JSON):\n{}\n\n{}\n\
         Task:\n\
         1) Determine whether this is a real service regression or monitoring/browser instability.\n\
         2) Reproduce read-only from the outside (HTTP requests, headless browser page load).\n\
         3) Provide a concise report: root cause hypothesis + evidence, scope/impact, and safe\n\
            next actions for a human operator.\n",
        serde_json::to_string_pretty(&details).unwrap_or_else(|_| details.to_string()),
        READ_ONLY_RULES,
    )
}
