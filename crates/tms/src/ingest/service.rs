//! Background polling loop around an [`Ingestor`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::pipeline::{CycleSummary, IngestPhase, Ingestor};

/// Snapshot returned by [`IngestionService::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    pub phase: IngestPhase,
    pub uid_max: u32,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_summary: Option<CycleSummary>,
}

#[derive(Default)]
struct CycleRecord {
    last_cycle_at: Option<DateTime<Utc>>,
    last_summary: Option<CycleSummary>,
}

#[derive(Default)]
struct Stats {
    cycles: AtomicU64,
    last: Mutex<CycleRecord>,
}

impl Stats {
    fn record(&self, summary: &CycleSummary) {
        self.cycles.fetch_add(1, Ordering::AcqRel);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.last_cycle_at = Some(Utc::now());
        last.last_summary = Some(summary.clone());
    }
}

/// Polls the mailbox every `poll_interval` until stopped.
///
/// The first cycle runs as soon as the service starts. `request_cycle`
/// cuts the current sleep short; `trigger` runs a cycle on the caller's
/// task and waits for it.
pub struct IngestionService {
    ingestor: Arc<Ingestor>,
    poll_interval: Duration,
    stop_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    stats: Arc<Stats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionService {
    pub fn new(ingestor: Arc<Ingestor>, poll_interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            ingestor,
            poll_interval,
            stop_tx,
            wake: Arc::new(Notify::new()),
            stats: Arc::new(Stats::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Spawns the polling loop on the current tokio runtime. Returns
    /// `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("Ingestion service already running");
            return false;
        }

        self.ingestor.resume();
        self.stop_tx.send_replace(false);

        let ingestor = Arc::clone(&self.ingestor);
        let stats = Arc::clone(&self.stats);
        let wake = Arc::clone(&self.wake);
        let stop_rx = self.stop_tx.subscribe();
        let interval = self.poll_interval;

        *handle = Some(tokio::spawn(poll_loop(
            ingestor, stats, wake, stop_rx, interval,
        )));
        log::info!(
            "Ingestion service started (poll interval {}s)",
            interval.as_secs()
        );
        true
    }

    /// Stops the loop. The cycle in flight finishes its current message and
    /// abandons its pending analyses. If the loop has not exited within
    /// `timeout` (a mailbox command can hold it for up to the command
    /// timeout) it is aborted: the session is dropped without LOGOUT and the
    /// cursor is stored from here instead. Returns whether it exited on its
    /// own.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return true;
        };

        log::info!("Stopping ingestion service");
        self.ingestor.halt();
        self.stop_tx.send_replace(true);

        let clean = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::error!("Ingestion loop ended abnormally: {}", e);
                false
            }
            Err(_) => {
                log::warn!(
                    "Ingestion loop did not stop within {:?}, aborting",
                    timeout
                );
                handle.abort();
                let _ = handle.await;
                self.ingestor.flush_cursor().await;
                false
            }
        };

        self.ingestor.set_phase(IngestPhase::Stopped);
        self.ingestor.resume();
        clean
    }

    /// Runs one cycle now and returns its summary. Waits for any cycle
    /// already in progress.
    pub async fn trigger(&self) -> CycleSummary {
        let summary = self.ingestor.run_cycle().await;
        self.stats.record(&summary);
        summary
    }

    /// Wakes the polling loop for an early cycle without waiting for it.
    pub fn request_cycle(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> ServiceStatus {
        let last = self.stats.last.lock().unwrap_or_else(|e| e.into_inner());
        ServiceStatus {
            running: self.is_running(),
            phase: self.ingestor.phase(),
            uid_max: self.ingestor.uid_max(),
            cycles_completed: self.stats.cycles.load(Ordering::Acquire),
            last_cycle_at: last.last_cycle_at,
            last_summary: last.last_summary.clone(),
        }
    }
}

async fn poll_loop(
    ingestor: Arc<Ingestor>,
    stats: Arc<Stats>,
    wake: Arc<Notify>,
    mut stop_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        // The first tick completes immediately, so the loop runs a cycle on start.
        tokio::select! {
            _ = ticker.tick() => {},
            _ = wake.notified() => {
                log::info!("Manual ingestion cycle requested");
                ticker.reset();
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            },
        }

        if *stop_rx.borrow() {
            break;
        }

        let summary = ingestor.run_cycle().await;
        stats.record(&summary);
        ingestor.set_phase(IngestPhase::Sleeping);
    }

    ingestor.set_phase(IngestPhase::Stopped);
    log::info!("Ingestion loop stopped");
}
