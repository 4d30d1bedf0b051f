//! Table watcher: change-tracking bootstrap and the re-armable notification
//! loop for a single table.
//!
//! A watcher moves through `Idle → Bootstrapping → Armed → Reconciling →
//! Armed` and ends in `Stopped`. Every notification, whatever it reports, is
//! treated as a trigger to read the changes past the watermark and to arm a
//! fresh single-shot subscription.

use crate::cancel::CancelSignal;
use crate::error::Result;
use crate::queue::QueueProducer;
use crate::tracker::{ChangeTracker, Notification, Subscription};
use crate::types::{ChangeEvent, ChangeVersion, ModelType, TableInfo};
use crossbeam_channel::select;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle phase of a watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherPhase {
    Idle,
    Bootstrapping,
    Armed,
    Reconciling,
    Stopped,
}

/// State owned by exactly one watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherState {
    pub table: String,
    pub columns: Vec<String>,
    /// Exclusive lower bound of the next differential read. Never decreases.
    pub last_change_version: ChangeVersion,
    pub is_listening: bool,
}

/// Backoff between failed attempts to arm a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Watches one table for changes and emits a [`ChangeEvent`] per changed row.
pub struct TableWatcher {
    state: WatcherState,
    model: ModelType,
    phase: WatcherPhase,
    tracker: Arc<dyn ChangeTracker>,
    subscription: Option<Subscription>,
    /// Read-only copy of the watermark for observers on other threads.
    published: Arc<AtomicI64>,
    /// Set once the watermark has a starting point (bootstrap or resume).
    has_baseline: bool,
}

impl TableWatcher {
    pub fn new(tracker: Arc<dyn ChangeTracker>, info: &TableInfo, model: ModelType) -> Self {
        Self {
            state: WatcherState {
                table: info.table.clone(),
                columns: info.columns.clone(),
                last_change_version: ChangeVersion::ZERO,
                is_listening: false,
            },
            model,
            phase: WatcherPhase::Idle,
            tracker,
            subscription: None,
            published: Arc::new(AtomicI64::new(0)),
            has_baseline: false,
        }
    }

    /// Start from a known watermark instead of querying the baseline.
    pub fn resume_from(&mut self, version: ChangeVersion) {
        self.advance_to(version);
        self.has_baseline = true;
    }

    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    pub fn phase(&self) -> WatcherPhase {
        self.phase
    }

    pub fn table(&self) -> &str {
        &self.state.table
    }

    pub fn last_change_version(&self) -> ChangeVersion {
        self.state.last_change_version
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_listening
    }

    /// Whether the watermark has a starting point, from bootstrap or resume.
    pub fn has_baseline(&self) -> bool {
        self.has_baseline
    }

    /// Shared handle to the published watermark.
    pub fn watermark_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.published)
    }

    /// Query the change-tracking baseline and start the watermark there.
    ///
    /// On failure the watermark stays where it is (0 for a fresh watcher),
    /// so changes already recorded are replayed at least once.
    pub fn bootstrap(&mut self) {
        self.phase = WatcherPhase::Bootstrapping;

        match self.tracker.current_version(&self.state.table) {
            Ok(version) => {
                self.advance_to(version);
                info!(
                    table = %self.state.table,
                    version = %self.state.last_change_version,
                    "change tracking initialized"
                );
            }
            Err(e) => {
                warn!(
                    table = %self.state.table,
                    error = %e,
                    version = %self.state.last_change_version,
                    "failed to initialize change tracking, replaying from current watermark"
                );
            }
        }

        self.has_baseline = true;
        self.phase = WatcherPhase::Idle;
    }

    /// Issue the watched query and register a single-shot notification.
    ///
    /// No-op if already armed. On failure the watcher stays idle and the
    /// error is returned so the caller can retry.
    pub fn arm(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }

        match self.tracker.arm(&self.state.table, &self.state.columns) {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.state.is_listening = true;
                self.phase = WatcherPhase::Armed;
                debug!(table = %self.state.table, "notification armed");
                Ok(())
            }
            Err(e) => {
                self.state.is_listening = false;
                self.phase = WatcherPhase::Idle;
                warn!(table = %self.state.table, error = %e, "failed to arm notification");
                Err(e)
            }
        }
    }

    /// Read changes past the watermark, emit them in ascending version order
    /// and advance the watermark. Returns the number of events emitted.
    ///
    /// On a backend error nothing is emitted and the watermark is kept, so
    /// the next call re-reads the same range.
    pub fn get_changes(&mut self, mut emit: impl FnMut(ChangeEvent)) -> usize {
        let since = self.state.last_change_version;
        let rows = match self.tracker.changes_since(&self.state.table, since) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    table = %self.state.table,
                    since = %since,
                    error = %e,
                    "failed to read changes"
                );
                return 0;
            }
        };

        let mut emitted = 0;
        for row in rows {
            // Already emitted on an earlier read.
            if row.version <= self.state.last_change_version {
                continue;
            }

            debug!(
                table = %self.state.table,
                row_id = %row.row_id,
                version = %row.version,
                operation = %row.operation,
                "change detected"
            );
            emit(ChangeEvent {
                change_version: row.version,
                operation: row.operation,
                row_id: row.row_id,
                table: self.state.table.clone(),
                model: self.model,
            });
            self.advance_to(row.version);
            emitted += 1;
        }

        emitted
    }

    /// Handle a fired subscription: drop it, reconcile, and re-arm.
    ///
    /// Returns true if the watcher ended up armed again.
    pub fn on_notification(
        &mut self,
        notification: Notification,
        mut emit: impl FnMut(ChangeEvent),
    ) -> bool {
        self.subscription = None;
        self.state.is_listening = false;
        self.phase = WatcherPhase::Reconciling;

        if let Notification::Unexpected { info } = &notification {
            warn!(table = %self.state.table, info = %info, "unexpected notification");
        }

        self.get_changes(&mut emit);
        self.arm_and_catch_up(&mut emit).is_ok()
    }

    /// Arm, then read once more: changes committed after the last read but
    /// before the subscription existed would otherwise never fire it.
    pub fn arm_and_catch_up(&mut self, emit: impl FnMut(ChangeEvent)) -> Result<()> {
        self.arm()?;
        self.get_changes(emit);
        Ok(())
    }

    /// Run `arm → wait → reconcile → arm` until cancelled, pushing events
    /// into `producer`. Returns the watcher so its watermark can be reused.
    pub fn run(mut self, producer: QueueProducer, cancel: CancelSignal, retry: RetryPolicy) -> Self {
        if !self.has_baseline {
            self.bootstrap();
        }

        let mut emit = |event: ChangeEvent| {
            producer.push(event);
        };
        let mut failed_arms: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.subscription.is_none() {
                if failed_arms > 0 {
                    let delay = retry.delay(failed_arms - 1);
                    debug!(table = %self.state.table, ?delay, "retrying arm");
                    if cancel.wait_timeout(delay) {
                        break;
                    }
                }
                match self.arm_and_catch_up(&mut emit) {
                    Ok(()) => failed_arms = 0,
                    Err(_) => {
                        failed_arms = failed_arms.saturating_add(1);
                        continue;
                    }
                }
            }

            let fired = match &self.subscription {
                Some(subscription) => select! {
                    recv(subscription.receiver()) -> msg => {
                        Some(msg.unwrap_or_else(|_| Notification::closed()))
                    }
                    recv(cancel.receiver()) -> _ => None,
                },
                None => continue,
            };

            match fired {
                Some(notification) => {
                    if !self.on_notification(notification, &mut emit) {
                        failed_arms = 1;
                    }
                }
                None => break,
            }
        }

        self.subscription = None;
        self.state.is_listening = false;
        self.phase = WatcherPhase::Stopped;
        info!(
            table = %self.state.table,
            version = %self.state.last_change_version,
            "watcher stopped"
        );
        self
    }

    fn advance_to(&mut self, version: ChangeVersion) {
        if version > self.state.last_change_version {
            self.state.last_change_version = version;
            self.published.store(version.0, Ordering::Release);
        }
    }
}
