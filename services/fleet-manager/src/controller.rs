//! Pass scheduling.
//!
//! Passes run on a timer, on configuration changes and on demand. At most one
//! pass is in flight; triggers that arrive meanwhile fold into a single rerun.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_reconcile::{CompletionOutcome, PassState, TriggerOutcome};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reconciler::{FlushReport, PassReport, Reconciler, RunnerInfo};
use crate::types::{FleetTarget, FlushMode};

struct Inner {
    reconciler: Reconciler,
    target: watch::Receiver<FleetTarget>,
    state: Mutex<PassState>,

    /// Held for the duration of a pass or flush.
    pass_lock: tokio::sync::Mutex<()>,
    reports: watch::Sender<Option<Arc<PassReport>>>,
    passes: AtomicU64,
}

/// Handle for triggering and observing reconciliation passes.
#[derive(Clone)]
pub struct PassController {
    inner: Arc<Inner>,
}

impl PassController {
    pub fn new(reconciler: Reconciler, target: watch::Receiver<FleetTarget>) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                reconciler,
                target,
                state: Mutex::new(PassState::Idle),
                pass_lock: tokio::sync::Mutex::new(()),
                reports,
                passes: AtomicU64::new(0),
            }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// The target the next pass will use.
    pub fn target(&self) -> FleetTarget {
        self.inner.target.borrow().clone()
    }

    /// Request a pass.
    ///
    /// Starts one in the background if none is running, otherwise folds into
    /// the pending rerun.
    pub fn trigger(&self, reason: &str) -> TriggerOutcome {
        let outcome = lock(&self.inner.state).on_trigger();
        match outcome {
            TriggerOutcome::Start => {
                debug!(reason, "Starting reconciliation pass");
                let controller = self.clone();
                tokio::spawn(async move { controller.drive().await });
            }
            TriggerOutcome::Coalesced => {
                debug!(reason, "Pass in flight, trigger coalesced");
            }
        }
        outcome
    }

    async fn drive(&self) {
        loop {
            let target = self.target();
            let report = {
                let _guard = self.inner.pass_lock.lock().await;
                self.inner.reconciler.run_pass(&target).await
            };
            self.inner.passes.fetch_add(1, Ordering::SeqCst);

            let next = lock(&self.inner.state).on_complete();
            self.inner.reports.send_replace(Some(Arc::new(report)));
            if next == CompletionOutcome::Idle {
                break;
            }
        }
    }

    /// Run passes on `interval` and on target changes until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut target_rx = self.inner.target.clone();
        let mut current = target_rx.borrow_and_update().clone();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Pass controller started");

        let mut tracking = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.trigger("interval");
                }
                changed = target_rx.changed(), if tracking => {
                    if changed.is_err() {
                        warn!("Target channel closed, configuration changes no longer tracked");
                        tracking = false;
                        continue;
                    }
                    let next = target_rx.borrow_and_update().clone();
                    self.inner.reconciler.apply_target_change(&current, &next).await;
                    info!(specs = next.specs.len(), global_cap = ?next.global_cap, "Fleet target changed");
                    current = next;
                    self.trigger("target_changed");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Pass controller shutting down");
                        break;
                    }
                }
            }
        }

        // Let an in-flight pass finish
        let _guard = self.inner.pass_lock.lock().await;
    }

    /// Flush runners, serialized with passes.
    pub async fn flush(&self, mode: FlushMode) -> Result<FlushReport> {
        let _guard = self.inner.pass_lock.lock().await;
        self.inner.reconciler.flush(mode).await
    }

    pub async fn runner_info(&self) -> Result<RunnerInfo> {
        self.inner.reconciler.runner_info().await
    }

    pub fn last_report(&self) -> Option<Arc<PassReport>> {
        self.inner.reports.borrow().clone()
    }

    /// Receives every completed pass report.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<PassReport>>> {
        self.inner.reports.subscribe()
    }

    pub fn passes_completed(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PassState {
        *lock(&self.inner.state)
    }

    /// Wait until no pass is running or pending.
    pub async fn wait_idle(&self) {
        let mut reports = self.subscribe();
        while self.state().is_busy() {
            if reports.changed().await.is_err() {
                break;
            }
        }
    }

    /// Trigger a pass and wait for a report produced after the trigger.
    pub async fn run_once(&self) -> Option<Arc<PassReport>> {
        let mut reports = self.subscribe();
        self.trigger("manual");
        loop {
            if reports.changed().await.is_err() {
                return None;
            }
            if !self.state().is_busy() {
                return reports.borrow().clone();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
