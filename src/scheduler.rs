//! Batch scheduler.
//!
//! Owns its own loop and is the only periodic caller of
//! [`BatchOrchestrator::run_batch`]: one full run at startup, a full run
//! daily at the configured UTC hour, and an incremental run every interval.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::batch::BatchOrchestrator;
use crate::config::BatchConfig;
use crate::data::{BatchLog, BatchType};
use crate::store::RecommendationStore;

/// Running logs older than this are treated as abandoned by a dead process.
const STALE_RUNNING_HOURS: i64 = 24;

pub struct Scheduler {
    orchestrator: Arc<BatchOrchestrator>,
    store: Arc<dyn RecommendationStore>,
    config: BatchConfig,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<BatchOrchestrator>,
        store: Arc<dyn RecommendationStore>,
        config: BatchConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
        }
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            full_batch_hour = self.config.full_batch_hour,
            incremental_interval = ?self.config.incremental_interval,
            "Starting batch scheduler"
        );

        tokio::select! {
            _ = &mut shutdown => {
                info!("Scheduler stopped before the initial run");
                return;
            }
            _ = self.tick(BatchType::Full) => {}
        }

        let period = self.config.incremental_interval;
        let mut incremental = interval_at(Instant::now() + period, period);
        incremental.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let now = Utc::now();
            let until_full = (next_full_run(now, self.config.full_batch_hour) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = sleep(until_full) => {
                    self.tick(BatchType::Full).await;
                }
                _ = incremental.tick() => {
                    self.tick(BatchType::Incremental).await;
                }
            }
        }
    }

    /// One scheduled run, skipped while another batch is still in flight.
    pub async fn tick(&self, mode: BatchType) -> Option<BatchLog> {
        match self.store.latest_batch_log().await {
            Ok(Some(log)) if log.is_running() => {
                let age = Utc::now() - log.start_time;
                if age < ChronoDuration::hours(STALE_RUNNING_HOURS) {
                    info!(
                        batch_id = log.batch_id,
                        mode = %mode,
                        "Previous batch still running, skipping tick"
                    );
                    return None;
                }
                warn!(
                    batch_id = log.batch_id,
                    started = %log.start_time,
                    "Ignoring stale running batch log"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read latest batch log"),
        }

        match self.orchestrator.run_batch(mode, None).await {
            Ok(log) => Some(log),
            Err(e) => {
                error!(mode = %mode, error = %e, "Scheduled batch was refused");
                None
            }
        }
    }
}

/// Next top of `hour` (UTC) strictly after `now`.
pub fn next_full_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|at| Utc.from_utc_datetime(&at))
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
