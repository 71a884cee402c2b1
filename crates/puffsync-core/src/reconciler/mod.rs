//! Counter reconciliation
//!
//! Turns the device's raw, monotonically increasing counter into discrete
//! [`PuffEvent`]s without losing or duplicating usage across device resets,
//! dropped links and process restarts.
//!
//! The decision itself is the pure [`reconcile`] function. [`CounterReconciler`]
//! wraps it with the in-memory last-seen values and the baseline store, and
//! performs each reconciliation as read → decide → persist. The event is only
//! handed back after the baseline is durable.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::PuffEvent;
use crate::error::Result;
use crate::traits::{BaselineStore, DeviceIdentity};

/// What was known about a device before a reading arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prior {
    /// Nothing in memory and nothing persisted
    Unknown,
    /// First reading of this process lifetime; value from the baseline store
    Persisted(u32),
    /// Last value seen on the live link
    Live(u32),
}

/// Outcome of one reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    /// Usage to report, `None` when nothing new happened
    pub delta: Option<u32>,
    /// Value to persist as the new baseline
    pub baseline: u32,
    /// Why the step came out the way it did
    pub kind: ReconcileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileKind {
    /// No prior value; the reading only establishes the baseline
    Initial,
    /// Usage that accrued while this process was not watching
    CatchUp,
    /// Usage observed on the live link
    Live,
    /// Same value as before (duplicate notification)
    Unchanged,
    /// Counter went backwards: the device was reset or power-cycled
    Reset,
}

/// Decide what a new reading means given what was known before it.
///
/// A decrease is evidence of a device reset, never negative usage, so it
/// rebases without an event. The new baseline is always the reading.
pub fn reconcile(prior: Prior, reading: u32) -> Reconciliation {
    let (previous, increase_kind) = match prior {
        Prior::Unknown => {
            return Reconciliation {
                delta: None,
                baseline: reading,
                kind: ReconcileKind::Initial,
            };
        }
        Prior::Persisted(value) => (value, ReconcileKind::CatchUp),
        Prior::Live(value) => (value, ReconcileKind::Live),
    };

    let (delta, kind) = match reading.checked_sub(previous) {
        None => (None, ReconcileKind::Reset),
        Some(0) => (None, ReconcileKind::Unchanged),
        Some(delta) => (Some(delta), increase_kind),
    };

    Reconciliation {
        delta,
        baseline: reading,
        kind,
    }
}

/// Stateful reconciler for every device seen by a session
///
/// Not re-entrant by construction: [`observe`](Self::observe) takes
/// `&mut self`, so the owner decides how readings are serialized.
pub struct CounterReconciler {
    store: Arc<dyn BaselineStore>,
    last_seen: HashMap<String, u32>,
}

impl CounterReconciler {
    pub fn new(store: Arc<dyn BaselineStore>) -> Self {
        Self {
            store,
            last_seen: HashMap::new(),
        }
    }

    /// Reconcile one raw reading
    ///
    /// Persists the new baseline before returning. If persisting fails the
    /// error is returned, no event is produced and the in-memory value is left
    /// untouched, so the next reading still accounts for this one's usage.
    pub async fn observe(
        &mut self,
        device: &DeviceIdentity,
        reading: u32,
    ) -> Result<Option<PuffEvent>> {
        let prior = match self.last_seen.get(&device.id) {
            Some(value) => Prior::Live(*value),
            None => match self.store.get_baseline(&device.id).await? {
                Some(value) => Prior::Persisted(value),
                None => Prior::Unknown,
            },
        };

        let outcome = reconcile(prior, reading);
        self.store.set_baseline(device, outcome.baseline).await?;
        self.last_seen.insert(device.id.clone(), outcome.baseline);

        match outcome.kind {
            ReconcileKind::Reset => info!(
                device = %device,
                ?prior,
                reading,
                "Counter went backwards, treating as device reset"
            ),
            ReconcileKind::CatchUp => info!(
                device = %device,
                ?prior,
                reading,
                "Catching up on usage since last run"
            ),
            _ => debug!(device = %device, ?prior, reading, kind = ?outcome.kind, "Reconciled"),
        }

        Ok(outcome.delta.map(|delta| PuffEvent::new(delta, reading)))
    }

    /// Drop in-memory tracking for a device (link released or lost)
    ///
    /// The persisted baseline is kept, so the next reading is reconciled
    /// against it as a catch-up.
    pub fn forget_live(&mut self, device_id: &str) {
        self.last_seen.remove(device_id);
    }

    /// Last value seen on a live link, if any
    pub fn last_seen(&self, device_id: &str) -> Option<u32> {
        self.last_seen.get(device_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryBaselineStore;
    use async_trait::async_trait;
    use proptest::prelude::*;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("dev-1")
    }

    async fn deltas(reconciler: &mut CounterReconciler, readings: &[u32]) -> Vec<u32> {
        let mut out = Vec::new();
        for reading in readings {
            if let Some(event) = reconciler.observe(&device(), *reading).await.unwrap() {
                out.push(event.delta);
            }
        }
        out
    }

    #[test]
    fn first_reading_without_baseline_only_establishes_it() {
        let outcome = reconcile(Prior::Unknown, 500);
        assert_eq!(outcome.delta, None);
        assert_eq!(outcome.baseline, 500);
        assert_eq!(outcome.kind, ReconcileKind::Initial);
    }

    #[test]
    fn decrease_is_a_reset_not_negative_usage() {
        let live = reconcile(Prior::Live(100), 3);
        assert_eq!((live.delta, live.baseline, live.kind), (None, 3, ReconcileKind::Reset));

        // Reset wins over catch-up after a restart as well
        let persisted = reconcile(Prior::Persisted(100), 3);
        assert_eq!(persisted.delta, None);
        assert_eq!(persisted.kind, ReconcileKind::Reset);
    }

    #[tokio::test]
    async fn reset_tolerance_sequence() {
        let store = MemoryBaselineStore::with_baselines([(device(), 90)]);
        let mut reconciler = CounterReconciler::new(Arc::new(store.clone()));

        assert_eq!(deltas(&mut reconciler, &[100, 3, 10]).await, vec![10, 7]);
        assert_eq!(store.get_baseline("dev-1").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn restart_catch_up_emits_one_combined_event() {
        let store = MemoryBaselineStore::with_baselines([(device(), 50)]);
        let mut reconciler = CounterReconciler::new(Arc::new(store));

        let event = reconciler.observe(&device(), 70).await.unwrap().unwrap();
        assert_eq!(event.delta, 20);
        assert_eq!(event.total, 70);
        assert!(reconciler.observe(&device(), 70).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_notifications_are_idempotent() {
        let store = MemoryBaselineStore::with_baselines([(device(), 42)]);
        let mut reconciler = CounterReconciler::new(Arc::new(store));

        assert!(deltas(&mut reconciler, &[42, 42]).await.is_empty());
    }

    #[tokio::test]
    async fn every_reading_is_persisted_even_without_event() {
        let store = MemoryBaselineStore::new();
        let mut reconciler = CounterReconciler::new(Arc::new(store.clone()));

        reconciler.observe(&device(), 8).await.unwrap();
        assert_eq!(store.get_baseline("dev-1").await.unwrap(), Some(8));

        reconciler.observe(&device(), 2).await.unwrap();
        assert_eq!(store.get_baseline("dev-1").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn forgetting_live_state_falls_back_to_baseline() {
        let store = MemoryBaselineStore::new();
        let mut reconciler = CounterReconciler::new(Arc::new(store));

        assert_eq!(deltas(&mut reconciler, &[5, 9]).await, vec![4]);
        reconciler.forget_live("dev-1");
        assert_eq!(reconciler.last_seen("dev-1"), None);

        // Usage while the link was down comes back as one catch-up
        assert_eq!(deltas(&mut reconciler, &[15]).await, vec![6]);
    }

    struct FailingStore;

    #[async_trait]
    impl BaselineStore for FailingStore {
        async fn get_baseline(&self, _device_id: &str) -> Result<Option<u32>> {
            Ok(Some(10))
        }
        async fn get_record(
            &self,
            _device_id: &str,
        ) -> Result<Option<crate::traits::BaselineRecord>> {
            Ok(None)
        }
        async fn set_baseline(&self, _device: &DeviceIdentity, _value: u32) -> Result<()> {
            Err(crate::Error::baseline_store("disk full"))
        }
        async fn delete_baseline(&self, _device_id: &str) -> Result<()> {
            Ok(())
        }
        async fn list_devices(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_persist_emits_nothing_and_keeps_state() {
        let mut reconciler = CounterReconciler::new(Arc::new(FailingStore));

        let result = reconciler.observe(&device(), 15).await;
        assert!(matches!(result, Err(crate::Error::BaselineStore(_))));
        assert_eq!(reconciler.last_seen("dev-1"), None);
    }

    proptest! {
        #[test]
        fn no_negative_or_zero_events(start in any::<u32>(), readings in prop::collection::vec(any::<u32>(), 0..64)) {
            let mut prior = Prior::Persisted(start);
            for reading in readings {
                let outcome = reconcile(prior, reading);
                if let Some(delta) = outcome.delta {
                    prop_assert!(delta > 0);
                }
                prop_assert_eq!(outcome.baseline, reading);
                prior = Prior::Live(outcome.baseline);
            }
        }

        #[test]
        fn deltas_are_conserved_without_resets(start in 0u32..1_000_000, steps in prop::collection::vec(0u32..1000, 0..64)) {
            let mut prior = Prior::Persisted(start);
            let mut reading = start;
            let mut sum: u64 = 0;
            for step in steps {
                reading += step;
                let outcome = reconcile(prior, reading);
                sum += u64::from(outcome.delta.unwrap_or(0));
                prior = Prior::Live(outcome.baseline);
            }
            prop_assert_eq!(sum, u64::from(reading - start));
        }
    }
}
