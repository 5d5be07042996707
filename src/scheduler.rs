use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{
    BACKOFF_FACTOR, BACKOFF_FACTOR_MAX, BACKOFF_FAIL_STREAK, BACKOFF_FAIL_STREAK_MAX,
    SCHEDULER_TICK_SECS,
};
use crate::domains::DomainSet;
use crate::runner::recover_stale_leases;
use crate::state::SharedState;
use crate::store::now_ts;

/// Multiplier applied to a subject's interval while it is persistently
/// failing, so a dead target does not burn runner capacity at full rate.
/// Resets implicitly when a success clears the streak.
pub fn backoff_factor(fail_streak: i64) -> f64 {
    if fail_streak >= BACKOFF_FAIL_STREAK_MAX {
        BACKOFF_FACTOR_MAX
    } else if fail_streak >= BACKOFF_FAIL_STREAK {
        BACKOFF_FACTOR
    } else {
        1.0
    }
}

/// Single-writer scheduling loop: one tick per second selects due subjects,
/// applies quotas and jitter, and enqueues work. Domains are probed via
/// in-process tasks; tests go through the durable queue.
pub fn spawn_scheduler(state: SharedState, domains: DomainSet) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Scheduler started (global cap {}, per-tenant cap {})",
            state.config.global_concurrency, state.config.per_tenant_concurrency
        );
        let mut shutdown = state.shutdown_requested();
        let probe_permits = std::sync::Arc::new(tokio::sync::Semaphore::new(
            crate::config::DOMAIN_PROBE_CONCURRENCY,
        ));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(SCHEDULER_TICK_SECS)) => {}
                _ = shutdown.recv() => {
                    info!("Scheduler stopping");
                    return;
                }
            }

            recover_stale_leases(&state).await;
            tick_tests(&state).await;
            crate::domains::tick_domains(&state, &domains, &probe_permits).await;
        }
    })
}

async fn tick_tests(state: &SharedState) {
    let due = match state.store.due_tests(64) {
        Ok(d) => d,
        Err(e) => {
            error!("Due scan failed: {}", e);
            return;
        }
    };
    if due.is_empty() {
        return;
    }

    let mut open_total = match state.store.open_entry_count() {
        Ok(n) => n,
        Err(e) => {
            error!("Queue count failed: {}", e);
            return;
        }
    };
    let mut open_per_tenant: HashMap<String, i64> = HashMap::new();

    for test in due {
        // Shedding: leave next_due_ts alone so the subject reappears on the
        // next tick once capacity frees up.
        if open_total >= state.config.global_concurrency {
            debug!("Global concurrency cap reached; deferring {}", test.test_id);
            continue;
        }
        let tenant_open = match open_per_tenant.get(&test.tenant_id) {
            Some(n) => *n,
            None => match state.store.open_entry_count_for_tenant(&test.tenant_id) {
                Ok(n) => {
                    open_per_tenant.insert(test.tenant_id.clone(), n);
                    n
                }
                Err(e) => {
                    error!("Tenant count failed: {}", e);
                    continue;
                }
            },
        };
        if tenant_open >= state.config.per_tenant_concurrency {
            debug!(
                "Tenant {} concurrency cap reached; deferring {}",
                test.tenant_id, test.test_id
            );
            continue;
        }

        let now = now_ts();
        let jitter = if test.jitter_seconds > 0 {
            rand::thread_rng().gen_range(0..=test.jitter_seconds) as f64
        } else {
            0.0
        };
        let next_due =
            now + test.interval_seconds as f64 * backoff_factor(test.fail_streak) + jitter;

        if let Err(e) = state.store.set_next_due(&test.test_id, next_due) {
            error!("Failed to reschedule {}: {}", test.test_id, e);
            continue;
        }
        match state.store.enqueue_run(&test.test_id, now) {
            Ok(true) => {
                open_total += 1;
                *open_per_tenant.entry(test.tenant_id.clone()).or_insert(0) += 1;
                debug!("Enqueued run for {}", test.test_id);
            }
            Ok(false) => {
                // Coalesced: an entry appeared between the due scan and the
                // insert (run-now racing the tick). Harmless.
            }
            Err(e) => error!("Enqueue failed for {}: {}", test.test_id, e),
        }
    }
}
