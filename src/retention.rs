use std::time::Duration;
use tracing::{info, warn};

use crate::config::RETENTION_SWEEP_INTERVAL_SECS;
use crate::state::SharedState;
use crate::store::now_ts;

/// Daily sweep: run metadata is kept much longer than artifact blobs, so a
/// run record may legitimately outlive its screenshots.
pub fn spawn_retention(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = state.shutdown_requested();
        loop {
            sweep(&state).await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(RETENTION_SWEEP_INTERVAL_SECS)) => {}
                _ = shutdown.recv() => return,
            }
        }
    })
}

async fn sweep(state: &SharedState) {
    let now = now_ts();

    let run_cutoff = now - state.config.run_retention_days as f64 * 86400.0;
    match state.store.prune_runs_before(run_cutoff) {
        Ok(0) => {}
        Ok(n) => info!("Retention: pruned {} old run records", n),
        Err(e) => warn!("Retention: run prune failed: {}", e),
    }

    let artifact_cutoff = now - state.config.artifact_retention_days as f64 * 86400.0;
    match prune_artifact_dirs(&state.config.artifacts_dir(), artifact_cutoff) {
        Ok(0) => {}
        Ok(n) => info!("Retention: pruned {} artifact directories", n),
        Err(e) => warn!("Retention: artifact prune failed: {}", e),
    }
}

/// Remove per-run artifact directories whose contents are older than the
/// cutoff. Layout: artifacts/<tenant>/<test>/<run>/.
pub fn prune_artifact_dirs(root: &std::path::Path, cutoff_ts: f64) -> std::io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for tenant in std::fs::read_dir(root)? {
        let tenant = tenant?.path();
        if !tenant.is_dir() {
            continue;
        }
        for test in std::fs::read_dir(&tenant)? {
            let test = test?.path();
            if !test.is_dir() {
                continue;
            }
            for run in std::fs::read_dir(&test)? {
                let run = run?.path();
                if !run.is_dir() {
                    continue;
                }
                let mtime = run
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64());
                if let Some(mtime) = mtime {
                    if mtime < cutoff_ts && std::fs::remove_dir_all(&run).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
    }
    Ok(removed)
}
