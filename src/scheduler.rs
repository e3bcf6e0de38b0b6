// src/scheduler.rs
//! Coalescing scheduler
//! - Batches a burst of named parameter changes over a sliding quiet window
//! - Fires at most one trigger once changes stop arriving
//! - Armed waits are one-shot and superseded by newer changes
//!
//! A render trigger fires only after a genuine quiet period: the armed wait
//! re-checks time-since-last-change on wake and re-sleeps the remainder if a
//! change slipped in, rather than firing a fixed delay after the burst began.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::params::ParamValue;

/// Event pushed to the scheduler's consumer when a render should start.
#[derive(Debug)]
pub enum RenderTrigger {
    /// A batch of coalesced changes went quiet. Carries the final
    /// (last-write-wins) value observed for each name.
    ParameterBatch(HashMap<String, ParamValue>),
    /// `force_render` bypassed the quiet window.
    ForceRender,
}

/// One recorded change. Later changes to the same name overwrite it.
struct ParameterChange {
    value: ParamValue,
    arrived: Instant,
}

#[derive(Default)]
struct PendingBatch {
    changes: HashMap<String, ParameterChange>,
    last_change: Option<Instant>,
}

/// Scheduler state for the performance-stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub pending_changes: usize,
    pub armed: bool,
}

struct SchedulerInner {
    quiet_window: Mutex<Duration>,
    pending: Mutex<PendingBatch>,
    trigger_tx: Mutex<Option<UnboundedSender<RenderTrigger>>>,
    /// Bumped on every change and on force; an armed wait holding a stale
    /// generation exits without firing.
    generation: AtomicU64,
    armed: AtomicBool,
}

pub struct CoalescingScheduler {
    inner: Arc<SchedulerInner>,
}

impl CoalescingScheduler {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                quiet_window: Mutex::new(quiet_window),
                pending: Mutex::new(PendingBatch::default()),
                trigger_tx: Mutex::new(None),
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_quiet_window(&self, quiet_window: Duration) {
        *self.inner.quiet_window.lock() = quiet_window;
    }

    pub fn quiet_window(&self) -> Duration {
        *self.inner.quiet_window.lock()
    }

    /// Register the trigger consumer. Replaces any previous sender.
    pub fn set_trigger(&self, tx: UnboundedSender<RenderTrigger>) {
        *self.inner.trigger_tx.lock() = Some(tx);
    }

    /// Record a change and (re-)arm the quiet-window wait.
    ///
    /// Never blocks and never fails: without an ambient tokio runtime the
    /// deferred wait cannot be armed, so the change is only recorded and the
    /// caller is expected to use `force_render` (or a later call made from
    /// inside a runtime) to fire the batch. That degraded mode is logged once
    /// per call, not surfaced as an error.
    pub fn update_parameter(&self, name: String, value: ParamValue) {
        let now = Instant::now();
        {
            let mut pending = self.inner.pending.lock();
            pending.changes.insert(name, ParameterChange { value, arrived: now });
            pending.last_change = Some(now);
        }

        // Supersede any armed wait before arming the new one.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!(
                    "{}; change recorded, waiting for force_render",
                    crate::Error::SchedulingUnavailable
                );
                return;
            }
        };

        self.inner.armed.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        handle.spawn(async move {
            let mut wait = *inner.quiet_window.lock();
            loop {
                tokio::time::sleep(wait).await;
                if inner.generation.load(Ordering::SeqCst) != generation {
                    // A newer change owns the wait now.
                    return;
                }
                let window = *inner.quiet_window.lock();
                let since_last = inner
                    .pending
                    .lock()
                    .last_change
                    .map(|t| t.elapsed())
                    .unwrap_or(window);
                if since_last >= window {
                    break;
                }
                // Not a genuine quiet period yet; sleep out the remainder.
                wait = window - since_last;
            }
            inner.armed.store(false, Ordering::SeqCst);
            Self::fire(&inner, false);
        });
    }

    /// Cancel any armed wait and fire immediately if at least one change is
    /// pending and a consumer is registered. Pending changes are cleared
    /// regardless.
    pub fn force_render(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.armed.store(false, Ordering::SeqCst);
        Self::fire(&self.inner, true);
    }

    fn fire(inner: &SchedulerInner, forced: bool) {
        let batch = {
            let mut pending = inner.pending.lock();
            pending.last_change = None;
            std::mem::take(&mut pending.changes)
        };
        if batch.is_empty() {
            return;
        }

        let tx = inner.trigger_tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                let trigger = if forced {
                    RenderTrigger::ForceRender
                } else {
                    RenderTrigger::ParameterBatch(
                        batch
                            .into_iter()
                            .map(|(name, change)| (name, change.value))
                            .collect(),
                    )
                };
                if tx.send(trigger).is_err() {
                    log::warn!("render trigger consumer dropped; batch discarded");
                }
            }
            None => {
                log::warn!(
                    "quiet period elapsed with no trigger consumer; {} changes discarded",
                    batch.len()
                );
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().changes.len()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    /// Age of the oldest still-pending change, if any.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        let pending = self.inner.pending.lock();
        pending
            .changes
            .values()
            .map(|change| change.arrived.elapsed())
            .max()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending_changes: self.pending_count(),
            armed: self.is_armed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::advance;

    const WINDOW: Duration = Duration::from_millis(100);

    fn wired(window: Duration) -> (CoalescingScheduler, UnboundedReceiver<RenderTrigger>) {
        let scheduler = CoalescingScheduler::new(window);
        let (tx, rx) = unbounded_channel();
        scheduler.set_trigger(tx);
        (scheduler, rx)
    }

    fn batch_of(trigger: RenderTrigger) -> HashMap<String, ParamValue> {
        match trigger {
            RenderTrigger::ParameterBatch(batch) => batch,
            RenderTrigger::ForceRender => panic!("expected a parameter batch"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_trigger() {
        // Changes at t=0, t=40ms, t=90ms; the trigger fires once, near
        // t=190ms, with only the final value for "size".
        let (scheduler, mut rx) = wired(WINDOW);
        let t0 = Instant::now();

        scheduler.update_parameter("size".into(), 1.0.into());
        advance(Duration::from_millis(40)).await;
        scheduler.update_parameter("size".into(), 2.0.into());
        advance(Duration::from_millis(50)).await;
        scheduler.update_parameter("size".into(), 3.0.into());

        let trigger = rx.recv().await.unwrap();
        let fired_after = t0.elapsed();
        assert!(
            fired_after >= Duration::from_millis(190),
            "fired too early: {:?}",
            fired_after
        );
        assert!(fired_after < Duration::from_millis(250));

        let batch = batch_of(trigger);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get("size"), Some(&ParamValue::Number(3.0)));

        // Nothing further queued and nothing pending.
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_names_join_one_batch() {
        let (scheduler, mut rx) = wired(WINDOW);

        scheduler.update_parameter("size".into(), 10.0.into());
        advance(Duration::from_millis(30)).await;
        scheduler.update_parameter("holes".into(), 4.0.into());

        let batch = batch_of(rx.recv().await.unwrap());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get("size"), Some(&ParamValue::Number(10.0)));
        assert_eq!(batch.get("holes"), Some(&ParamValue::Number(4.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fire_before_quiet_period() {
        let (scheduler, mut rx) = wired(WINDOW);

        scheduler.update_parameter("size".into(), 1.0.into());
        advance(Duration::from_millis(60)).await;
        scheduler.update_parameter("size".into(), 2.0.into());

        // 60ms + 90ms: inside the second change's window, nothing yet.
        advance(Duration::from_millis(90)).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.is_armed());

        advance(Duration::from_millis(20)).await;
        let batch = batch_of(rx.recv().await.unwrap());
        assert_eq!(batch.get("size"), Some(&ParamValue::Number(2.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_render_fires_immediately_and_clears() {
        let (scheduler, mut rx) = wired(WINDOW);

        scheduler.update_parameter("size".into(), 5.0.into());
        scheduler.force_render();

        assert!(matches!(
            rx.try_recv().unwrap(),
            RenderTrigger::ForceRender
        ));
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.is_armed());

        // The cancelled wait must not fire a second trigger later.
        advance(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_render_without_pending_is_a_noop() {
        let (scheduler, mut rx) = wired(WINDOW);
        scheduler.force_render();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_degraded_mode_without_runtime() {
        // Outside a tokio runtime the change is recorded but no wait arms;
        // force_render still flushes it.
        let (tx, mut rx) = unbounded_channel();
        let scheduler = CoalescingScheduler::new(WINDOW);
        scheduler.set_trigger(tx);

        scheduler.update_parameter("size".into(), 7.0.into());
        assert_eq!(scheduler.pending_count(), 1);
        assert!(!scheduler.is_armed());
        assert!(scheduler.oldest_pending_age().is_some());

        scheduler.force_render();
        assert!(matches!(
            rx.try_recv().unwrap(),
            RenderTrigger::ForceRender
        ));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_trigger_unregisters_previous() {
        let (scheduler, mut old_rx) = wired(WINDOW);
        let (new_tx, mut new_rx) = unbounded_channel();
        scheduler.set_trigger(new_tx);

        scheduler.update_parameter("size".into(), 1.0.into());
        advance(Duration::from_millis(150)).await;

        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.recv().await.is_some());
    }
}
