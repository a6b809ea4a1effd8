//! Property-based invariant tests for broker propagation.
//!
//! 1. A batch notifies each changed holder exactly once, after all sources.
//! 2. Separate top-level updates notify once per change.
//! 3. Failed updates never alter the held value or notify.
//! 4. Any cascade depth limit terminates a two-hop cycle with one hit.
//! 5. Release always restores defaults.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cascade_core::{Source, Target, UpdateBy, UpdateError, Wiring};
use cascade_runtime::{Broker, BrokerConfig};
use proptest::prelude::*;

// ── Fixtures ──────────────────────────────────────────────────────────────

struct Add(u16);
impl Source for Add {}

struct Reading(i32);
impl Source for Reading {}

#[derive(Clone, Default, Debug, PartialEq)]
struct Total {
    sum: u64,
}

impl Target for Total {
    fn wire(wiring: &mut Wiring<Self>) {
        wiring.accepts::<Add>();
    }
}

impl UpdateBy<Add> for Total {
    fn update_by(&mut self, source: &Add) -> Result<bool, UpdateError> {
        self.sum += u64::from(source.0);
        Ok(source.0 != 0)
    }
}

#[derive(Clone, Default, Debug, PartialEq)]
struct Gauge {
    value: Option<i32>,
}

impl Target for Gauge {
    fn wire(wiring: &mut Wiring<Self>) {
        wiring.accepts::<Reading>();
    }
}

impl UpdateBy<Reading> for Gauge {
    fn update_by(&mut self, source: &Reading) -> Result<bool, UpdateError> {
        let previous = self.value.replace(source.0);
        if source.0 < 0 {
            return Err(UpdateError::rejected("negative reading"));
        }
        Ok(previous != Some(source.0))
    }
}

#[derive(Clone, Default, Debug)]
struct Left {
    hops: u32,
}
impl Source for Left {}

#[derive(Clone, Default, Debug)]
struct Right {
    hops: u32,
}
impl Source for Right {}

impl Target for Left {
    fn wire(wiring: &mut Wiring<Self>) {
        wiring.accepts::<Right>();
    }

    fn as_source(&self) -> Option<&dyn Source> {
        Some(self)
    }
}

impl Target for Right {
    fn wire(wiring: &mut Wiring<Self>) {
        wiring.accepts::<Left>();
    }

    fn as_source(&self) -> Option<&dyn Source> {
        Some(self)
    }
}

impl UpdateBy<Right> for Left {
    fn update_by(&mut self, source: &Right) -> Result<bool, UpdateError> {
        self.hops = source.hops + 1;
        Ok(true)
    }
}

impl UpdateBy<Left> for Right {
    fn update_by(&mut self, source: &Left) -> Result<bool, UpdateError> {
        self.hops = source.hops + 1;
        Ok(true)
    }
}

fn count_notifications<T: Target>(broker: &Broker) -> (Rc<Cell<u32>>, cascade_core::Subscription) {
    let hits = Rc::new(Cell::new(0));
    let counter = Rc::clone(&hits);
    let sub = broker
        .observe::<T>()
        .subscribe(move |_: &T| counter.set(counter.get() + 1));
    (hits, sub)
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Batches notify once with the final value
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn batch_notifies_once_with_final_value(adds in prop::collection::vec(1u16..500, 1..24)) {
        let broker = Broker::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = broker
            .observe::<Total>()
            .subscribe(move |t: &Total| sink.borrow_mut().push(t.sum));

        let sources: Vec<Box<dyn Source>> = adds
            .iter()
            .map(|&n| Box::new(Add(n)) as Box<dyn Source>)
            .collect();
        broker.update_by_all(sources);

        let expected: u64 = adds.iter().map(|&n| u64::from(n)).sum();
        prop_assert_eq!(seen.borrow().clone(), vec![expected]);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Separate updates notify once per change
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn separate_updates_notify_per_change(adds in prop::collection::vec(0u16..4, 0..32)) {
        let broker = Broker::new();
        let (hits, _sub) = count_notifications::<Total>(&broker);

        for &n in &adds {
            broker.update_by(&Add(n));
        }

        let changes = adds.iter().filter(|&&n| n != 0).count();
        prop_assert_eq!(hits.get() as usize, changes);
        prop_assert_eq!(broker.stats().passes as usize, adds.len());
        prop_assert_eq!(broker.stats().updates_applied as usize, adds.len());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Failed updates are invisible
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn failed_updates_leave_no_trace(readings in prop::collection::vec(-5i32..10, 0..32)) {
        let broker = Broker::new();
        let (hits, _sub) = count_notifications::<Gauge>(&broker);

        let mut model: Option<i32> = None;
        let mut changes = 0u32;
        for &r in &readings {
            broker.update_by(&Reading(r));
            if r >= 0 && model != Some(r) {
                model = Some(r);
                changes += 1;
            }
        }

        let failures = readings.iter().filter(|&&r| r < 0).count();
        prop_assert_eq!(broker.get::<Gauge>().value, model);
        prop_assert_eq!(hits.get(), changes);
        prop_assert_eq!(broker.stats().updates_failed as usize, failures);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Cycles terminate at any depth limit
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn cycle_stops_at_depth_limit(limit in 0usize..40) {
        let broker = Broker::with_config(BrokerConfig::default().with_max_cascade_depth(limit));
        broker.declare::<Left>();
        broker.declare::<Right>();

        broker.update_by(&Left { hops: 0 });

        let stats = broker.stats();
        prop_assert_eq!(stats.depth_limit_hits, 1);
        prop_assert_eq!(stats.cascades as usize, limit);
        prop_assert_eq!(stats.notifications, if limit == 0 { 1 } else { 2 });
        let deepest = broker.get::<Left>().hops.max(broker.get::<Right>().hops);
        prop_assert_eq!(deepest as usize, limit + 1);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Release restores defaults
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn release_restores_defaults(adds in prop::collection::vec(1u16..100, 0..8), readings in prop::collection::vec(0i32..10, 0..8)) {
        let broker = Broker::new();
        broker.declare::<Total>();
        broker.declare::<Gauge>();
        for &n in &adds {
            broker.update_by(&Add(n));
        }
        for &r in &readings {
            broker.update_by(&Reading(r));
        }

        broker.release();
        prop_assert_eq!(broker.get::<Total>(), Total::default());
        prop_assert_eq!(broker.get::<Gauge>(), Gauge::default());
        prop_assert_eq!(broker.holder_count(), 2);
    }
}
