// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change fan-out: delivering `(key, new, old)` snapshots to observers
//! after every committed mutation.
//!
//! Snapshots are immutable by construction (`Arc<Value>` clones taken at
//! commit time), so observers can hold them without copying and cannot
//! corrupt session state. A panicking observer is caught and logged; it
//! never poisons the mutation or later deliveries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

/// A committed change delivered to observers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: String,
    /// The data after the mutation.
    pub new: Arc<Value>,
    /// The data before the mutation; `None` for the initial load.
    pub old: Option<Arc<Value>>,
}

/// An observer registered via store configuration.
pub type ChangeObserver = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Deliver `event` to every observer in registration order.
pub(crate) fn fan_out(observers: &[ChangeObserver], event: &ChangeEvent) {
    for observer in observers {
        let observer = observer.clone();
        if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
            warn!(key = %event.key, "change observer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(key: &str, new: Value, old: Option<Value>) -> ChangeEvent {
        ChangeEvent { key: key.into(), new: Arc::new(new), old: old.map(Arc::new) }
    }

    #[test]
    fn observers_see_both_snapshots() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let observers: Vec<ChangeObserver> = vec![Arc::new(move |e: &ChangeEvent| {
            s.lock().push((e.key.clone(), (*e.new).clone(), e.old.as_deref().cloned()));
        })];

        fan_out(&observers, &event("p1", json!({"coins": 3}), Some(json!({"coins": 10}))));
        fan_out(&observers, &event("p2", json!({"coins": 0}), None));

        let seen = seen.lock();
        assert_eq!(seen[0], ("p1".into(), json!({"coins": 3}), Some(json!({"coins": 10}))));
        assert_eq!(seen[1], ("p2".into(), json!({"coins": 0}), None));
    }

    #[test]
    fn panicking_observer_does_not_poison_later_ones() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let observers: Vec<ChangeObserver> = vec![
            Arc::new(|_| panic!("observer bug")),
            Arc::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        fan_out(&observers, &event("p1", json!(1), None));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_order_is_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let observers: Vec<ChangeObserver> = (0..4)
            .map(|i| {
                let order = order.clone();
                Arc::new(move |_: &ChangeEvent| order.lock().push(i)) as ChangeObserver
            })
            .collect();

        fan_out(&observers, &event("p1", json!(1), None));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
