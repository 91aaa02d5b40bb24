//! Scheduler module: the 1-minute probe tick.
//!
//! Each tick selects due monitors, fans them out in bounded batches and
//! writes the outcome back onto the configs. A probe failure never aborts a
//! batch and a tick failure never stops the loop.

mod maintenance;

pub use maintenance::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::cache::{Cache, ALL_MONITOR_CONFIGS};
use crate::db::{HistoryStatus, MonitorConfig, MonitorHistory, MonitorStatus, Store};
use crate::probe::ProbeExecutor;

/// Nominal tick period.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between probe batches to avoid traffic bursts.
const BATCH_PAUSE: Duration = Duration::from_secs(1);

/// A monitor is due when it never ran or its interval has elapsed.
pub fn is_due(config: &MonitorConfig, now: DateTime<Utc>) -> bool {
    match config.last_check_at {
        None => true,
        Some(last) => now - last >= ChronoDuration::minutes(config.interval_minutes as i64),
    }
}

/// Status snapshot exposed by the system API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub execution_count: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
}

/// The main scheduler orchestrating probe execution.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    cache: Cache,
    executor: ProbeExecutor,
    max_concurrent: usize,
    running: Arc<AtomicBool>,
    ticking: Arc<AtomicBool>,
    execution_count: Arc<AtomicU64>,
    last_execution: Arc<parking_lot::RwLock<Option<DateTime<Utc>>>>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        cache: Cache,
        executor: ProbeExecutor,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            max_concurrent: max_concurrent.max(1),
            running: Arc::new(AtomicBool::new(false)),
            ticking: Arc::new(AtomicBool::new(false)),
            execution_count: Arc::new(AtomicU64::new(0)),
            last_execution: Arc::new(parking_lot::RwLock::new(None)),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the tick loop in a background task.
    pub async fn start(&self) {
        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        {
            let mut stop = self.stop.lock().await;
            *stop = Some(tx);
        }
        self.running.store(true, Ordering::SeqCst);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        // A tick must complete before the next is considered.
                        if scheduler
                            .ticking
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                        {
                            tracing::warn!("Scheduler: previous tick still running, skipping");
                            continue;
                        }

                        scheduler.execution_count.fetch_add(1, Ordering::SeqCst);
                        *scheduler.last_execution.write() = Some(Utc::now());

                        // Dropping the tick future on stop aborts the JoinSet,
                        // discarding unfinished probe results.
                        tokio::select! {
                            _ = rx.recv() => {
                                scheduler.ticking.store(false, Ordering::SeqCst);
                                break;
                            }
                            _ = scheduler.run_tick() => {}
                        }
                        scheduler.ticking.store(false, Ordering::SeqCst);
                    }
                }
            }
            tracing::info!("Scheduler: stopped");
        });

        tracing::info!("Scheduler: started (tick {}s)", TICK_INTERVAL.as_secs());
    }

    /// Stop the loop and cancel in-flight probes.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            execution_count: self.execution_count.load(Ordering::SeqCst),
            last_execution_time: *self.last_execution.read(),
        }
    }

    async fn run_tick(&self) {
        let configs = match self.store.get_monitors() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Scheduler: failed to load monitors: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let due: Vec<MonitorConfig> = configs
            .into_iter()
            .filter(|c| c.enabled)
            .filter(|c| {
                if is_due(c, now) {
                    true
                } else {
                    if let Some(last) = c.last_check_at {
                        let next = last + ChronoDuration::minutes(c.interval_minutes as i64);
                        tracing::debug!(
                            "Scheduler: {} not due, next execution at {}",
                            c.name,
                            next.format("%H:%M:%S")
                        );
                    }
                    false
                }
            })
            .collect();

        if due.is_empty() {
            return;
        }
        tracing::info!("Scheduler: {} monitors due", due.len());

        for (i, batch) in due.chunks(self.max_concurrent).enumerate() {
            if i > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }

            let mut set = JoinSet::new();
            for config in batch {
                let executor = self.executor.clone();
                let config = config.clone();
                set.spawn(async move {
                    let record = executor.execute(&config).await;
                    (config.id, record)
                });
            }

            // Collect the whole batch before writing back: readers observe
            // either the previous tick's fields or this batch's, not a mix.
            let mut outcomes = Vec::with_capacity(batch.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => tracing::error!("Scheduler: probe task failed: {}", e),
                }
            }
            for (id, record) in &outcomes {
                self.write_back(id, record);
            }

            self.cache.clear_by_prefix(ALL_MONITOR_CONFIGS);
        }
    }

    /// Overwrite the status fields of a config from a probe outcome.
    fn write_back(&self, monitor_id: &str, record: &MonitorHistory) {
        // The monitor may have been deleted while its probe was in flight.
        let Some(mut config) = self.store.get_monitor(monitor_id) else {
            return;
        };
        config.last_check_at = Some(record.timestamp);
        config.status = match record.status {
            HistoryStatus::Success => MonitorStatus::Success,
            HistoryStatus::Error => MonitorStatus::Error,
        };
        config.last_error = record.error.clone();
        config.updated_at = Utc::now();
        self.store.save_monitor(&config);
    }
}
