pub mod protocol;
pub mod sandbox;

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use crate::config::{KILL_WAIT_TIMEOUT_SECS, RUN_TIMEOUT_GRACE_SECS, WORKER_IDLE_SLEEP_MS};
use crate::engine::{self, Observation, SubjectMeta};
use crate::state::SharedState;
use crate::store::{now_ts, ClaimedJob, RunCompletion, RunStatus};

use protocol::extract_result;

/// Spawn the runner worker pool. Each worker claims queue entries one at a
/// time and runs a single sandbox child at a time.
pub fn spawn_workers(state: SharedState) -> Vec<tokio::task::JoinHandle<()>> {
    (0..state.config.workers)
        .map(|i| {
            let state = state.clone();
            tokio::spawn(async move {
                worker_loop(state, format!("worker-{}", i)).await;
            })
        })
        .collect()
}

async fn worker_loop(state: SharedState, worker_id: String) {
    info!("Runner {} started", worker_id);
    let mut shutdown = state.shutdown_requested();

    loop {
        let claimed = match state
            .store
            .claim_next(&worker_id, RUN_TIMEOUT_GRACE_SECS as f64)
        {
            Ok(c) => c,
            Err(e) => {
                error!("{}: queue claim failed: {}", worker_id, e);
                None
            }
        };

        match claimed {
            Some(job) => {
                info!(
                    "{}: claimed run {} for test {} (attempt {})",
                    worker_id, job.run_id, job.test_id, job.attempt
                );
                execute_job(&state, &job).await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(WORKER_IDLE_SLEEP_MS)) => {}
                    _ = shutdown.recv() => {
                        info!("Runner {} stopping", worker_id);
                        return;
                    }
                }
            }
        }
    }
}

pub(crate) struct ChildOutput {
    pub(crate) status: Option<std::process::ExitStatus>,
    pub(crate) timed_out: bool,
    pub(crate) combined: String,
}

/// Spawn a sandbox child, enforce the hard wall-clock cap, and collect its
/// combined output. Also used by the domain browser probe.
pub(crate) async fn run_probe_child(
    mut cmd: tokio::process::Command,
    hard_timeout: Duration,
) -> std::io::Result<ChildOutput> {
    let mut child = cmd.spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let out_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stdout {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let (status, timed_out) = match tokio::time::timeout(hard_timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            warn!("Child wait error: {}", e);
            (None, false)
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = tokio::time::timeout(
                Duration::from_secs(KILL_WAIT_TIMEOUT_SECS),
                child.wait(),
            )
            .await;
            (None, true)
        }
    };

    let out = out_task.await.unwrap_or_default();
    let err = err_task.await.unwrap_or_default();
    let mut combined = out;
    if !err.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&err);
    }

    Ok(ChildOutput {
        status,
        timed_out,
        combined,
    })
}

fn run_artifacts_dir(state: &SharedState, job: &ClaimedJob) -> PathBuf {
    state
        .config
        .artifacts_dir()
        .join(&job.tenant_id)
        .join(&job.test_id)
        .join(&job.run_id)
}

async fn execute_job(state: &SharedState, job: &ClaimedJob) {
    let started_at = now_ts();
    let out_dir = run_artifacts_dir(state, job);
    let mut artifacts = serde_json::Map::new();

    let completion = match prepare_and_run(state, job, &out_dir, &mut artifacts).await {
        Ok(c) => c,
        Err(e) => {
            // Controller-side failures (missing source, spawn error) are
            // infra: the tenant's code never got its chance to run.
            warn!("Run {} infra failure: {}", job.run_id, e);
            RunCompletion {
                status: RunStatus::InfraDegraded,
                started_at_ts: started_at,
                finished_at_ts: now_ts(),
                elapsed_ms: None,
                error_kind: Some("runner_infra".to_string()),
                error_message: Some(e.to_string()),
                final_url: None,
                title: None,
                artifacts: artifacts.clone(),
            }
        }
    };

    // Short retry loop: losing a finished run to a transient busy database
    // would desync the queue from the state machine.
    let mut persisted = false;
    let mut delay = Duration::from_millis(100);
    for attempt in 0..3 {
        match state
            .store
            .complete_run(&job.entry_id, &job.run_id, &completion)
        {
            Ok(()) => {
                persisted = true;
                break;
            }
            Err(e) if attempt < 2 => {
                warn!("Persist of run {} failed (attempt {}): {}", job.run_id, attempt + 1, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => error!("Failed to persist run {}: {}", job.run_id, e),
        }
    }
    if !persisted {
        return;
    }

    let meta = match state.store.get_test_any(&job.test_id) {
        Ok(Some(test)) => SubjectMeta::from(&test),
        // Test deleted while the run was in flight; nothing to observe.
        Ok(None) => return,
        Err(e) => {
            error!("Failed to load test {}: {}", job.test_id, e);
            return;
        }
    };

    let obs = Observation {
        status: completion.status,
        elapsed_ms: completion.elapsed_ms,
        run_id: Some(job.run_id.clone()),
        error_kind: completion.error_kind.clone(),
        error_message: completion.error_message.clone(),
    };
    engine::observe(state, &meta, &obs).await;
}

async fn prepare_and_run(
    state: &SharedState,
    job: &ClaimedJob,
    out_dir: &PathBuf,
    artifacts: &mut serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<RunCompletion> {
    tokio::fs::create_dir_all(out_dir).await?;

    // Re-verify the kind/extension agreement; the source may have been
    // replaced since the entry was queued.
    let source_path = state.config.sources_dir().join(&job.source_relpath);
    let ext = source_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if ext != job.kind.extension() {
        anyhow::bail!(
            "source extension {:?} does not match kind {}",
            ext,
            job.kind.as_str()
        );
    }

    let source_bytes = tokio::fs::read(&source_path).await?;
    let local_source = out_dir.join(format!("source.{}", job.kind.extension()));
    tokio::fs::write(&local_source, &source_bytes).await?;

    let started_at = now_ts();
    let hard_timeout =
        Duration::from_secs(job.timeout_seconds.max(1) as u64 + RUN_TIMEOUT_GRACE_SECS);
    let cmd = sandbox::build_command(
        &state.config,
        job.kind,
        &local_source,
        &job.base_url,
        out_dir,
        job.timeout_seconds,
    );

    let output = run_probe_child(cmd, hard_timeout).await?;
    let finished_at = now_ts();

    // Controller-captured stdout/stderr, kept separate from the child's own
    // run.log record.
    if !output.combined.is_empty() {
        let log_path = out_dir.join("runner_output.log");
        if tokio::fs::write(&log_path, &output.combined).await.is_ok() {
            artifacts.insert(
                "runner_output".to_string(),
                serde_json::Value::String("runner_output.log".to_string()),
            );
        }
    }

    if output.timed_out {
        return Ok(RunCompletion {
            status: RunStatus::Timeout,
            started_at_ts: started_at,
            finished_at_ts: finished_at,
            elapsed_ms: Some((finished_at - started_at) * 1000.0),
            error_kind: Some("timeout".to_string()),
            error_message: Some(format!(
                "sandbox exceeded {}s + {}s grace and was killed",
                job.timeout_seconds, RUN_TIMEOUT_GRACE_SECS
            )),
            final_url: None,
            title: None,
            artifacts: artifacts.clone(),
        });
    }

    let Some(result) = extract_result(&output.combined) else {
        return Ok(RunCompletion {
            status: RunStatus::Fail,
            started_at_ts: started_at,
            finished_at_ts: finished_at,
            elapsed_ms: Some((finished_at - started_at) * 1000.0),
            error_kind: Some("runner_protocol".to_string()),
            error_message: Some("child produced no parsable E2E_RESULT_JSON line".to_string()),
            final_url: None,
            title: None,
            artifacts: artifacts.clone(),
        });
    };

    let status = result.effective_status();
    let mut error_message = result.error_message.clone();

    // Declared status wins over the exit code; a mismatch is recorded but
    // does not change classification.
    let exit_ok = output.status.map(|s| s.success()).unwrap_or(false);
    let declared_pass = status == RunStatus::Pass;
    if exit_ok != declared_pass {
        let note = format!(
            "exit code disagrees with declared status (exit_ok={}, status={})",
            exit_ok,
            status.as_str()
        );
        error_message = Some(match error_message {
            Some(msg) => format!("{} [{}]", msg, note),
            None => note,
        });
    }

    for (k, v) in &result.artifacts {
        artifacts.insert(k.clone(), v.clone());
    }

    Ok(RunCompletion {
        status,
        started_at_ts: started_at,
        finished_at_ts: finished_at,
        elapsed_ms: result
            .elapsed_ms
            .or(Some((finished_at - started_at) * 1000.0)),
        error_kind: result.error_kind.clone(),
        error_message,
        final_url: result.final_url.clone(),
        title: result.title.clone(),
        artifacts: artifacts.clone(),
    })
}

/// Startup recovery plus periodic sweep: any lease that outlived its bound
/// is treated as a lost worker and neutralized.
pub async fn recover_stale_leases(state: &SharedState) {
    match state.store.expire_stale_leases() {
        Ok(expired) => {
            for (test_id, run_id) in expired {
                warn!("Expired stale lease for test {} (run {})", test_id, run_id);
                let meta = match state.store.get_test_any(&test_id) {
                    Ok(Some(test)) => SubjectMeta::from(&test),
                    _ => continue,
                };
                let obs = Observation {
                    status: RunStatus::InfraDegraded,
                    elapsed_ms: None,
                    run_id: if run_id.is_empty() { None } else { Some(run_id) },
                    error_kind: Some("worker_lost".to_string()),
                    error_message: Some("lease expired; worker lost".to_string()),
                };
                engine::observe(state, &meta, &obs).await;
            }
        }
        Err(e) => error!("Lease expiry sweep failed: {}", e),
    }
}
