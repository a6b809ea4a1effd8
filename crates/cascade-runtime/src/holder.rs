#![forbid(unsafe_code)]

//! Per-type holders.
//!
//! A holder owns the single live instance of one target type inside a
//! [`Broker`], the couplings that mutate it, and the broadcast subject its
//! snapshots are published on.
//!
//! # Invariants
//!
//! 1. Coupling keys are unique and never replaced once set.
//! 2. A failed update leaves the previous value in place (when rollback is
//!    enabled) and neither enqueues nor cascades.
//! 3. A changed holder is enqueued before it cascades, so its notification
//!    precedes those of the holders it drives.
//! 4. `dispose` is idempotent; the next access revives the stream without
//!    repeating the wiring.

use std::any::{Any, TypeId, type_name};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use ahash::AHashMap;
use cascade_core::contract::{Projector, descends_from};
use cascade_core::{Broadcast, Couple, EmitReport, Source, SourceKind, Stream, Target, UpdateError};

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::queue::ChangeQueue;

/// Type-erased view of a holder, as seen by the broker.
pub(crate) trait Managed {
    fn target_type(&self) -> TypeId;

    fn target_name(&self) -> &'static str;

    /// Apply `source` (already at level `kind` of its parent chain).
    fn update_target(
        self: Rc<Self>,
        broker: &Broker,
        kind: SourceKind,
        source: &dyn Source,
        queue: &mut ChangeQueue,
        depth: usize,
    );

    /// Publish the current snapshot.
    fn on_changed(&self) -> EmitReport;

    fn dispose(&self);

    /// Push a snapshot projected as capability `capability` into `out`.
    fn project(&self, capability: TypeId, out: &mut dyn Any) -> bool;
}

pub(crate) struct HolderCell<T: Target> {
    target: RefCell<T>,
    couples: RefCell<AHashMap<SourceKind, Rc<dyn Couple<T>>>>,
    subject: RefCell<Broadcast<T>>,
    disposed: Cell<bool>,
    projectors: RefCell<Vec<(TypeId, Projector<T>)>>,
    notifications: Cell<u64>,
}

impl<T: Target> HolderCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            target: RefCell::new(T::default()),
            couples: RefCell::new(AHashMap::new()),
            subject: RefCell::new(Broadcast::new()),
            disposed: Cell::new(false),
            projectors: RefCell::new(Vec::new()),
            notifications: Cell::new(0),
        }
    }

    pub(crate) fn install_projectors(&self, projectors: Vec<(TypeId, Projector<T>)>) {
        *self.projectors.borrow_mut() = projectors;
    }

    /// Reopen the stream after a dispose.
    pub(crate) fn revive(&self) {
        if !self.disposed.get() {
            return;
        }
        *self.subject.borrow_mut() = Broadcast::new();
        self.disposed.set(false);
        tracing::debug!(message = "holder.revive", target = type_name::<T>());
    }

    /// Replace the target. Returns a snapshot when the new value is itself a
    /// source and should drive an update.
    pub(crate) fn replace(&self, value: T) -> Option<T> {
        let mut target = self.target.borrow_mut();
        *target = value;
        target.as_source().is_some().then(|| target.clone())
    }

    pub(crate) fn add_couple(&self, kind: SourceKind, couple: Rc<dyn Couple<T>>) -> Result<()> {
        let found = couple.source_kind();
        if found != kind {
            return Err(BrokerError::CouplingKindMismatch {
                expected: kind.name(),
                found: found.name(),
            });
        }
        match self.couples.borrow_mut().entry(kind) {
            Entry::Occupied(_) => Err(BrokerError::DuplicateCoupling {
                source_type: kind.name(),
                target_type: type_name::<T>(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(couple);
                Ok(())
            }
        }
    }

    pub(crate) fn has_couple(&self, kind: SourceKind) -> bool {
        self.couples.borrow().contains_key(&kind)
    }

    fn apply(
        &self,
        broker: &Broker,
        couple: &dyn Couple<T>,
        source: &dyn Source,
    ) -> Option<std::result::Result<bool, UpdateError>> {
        let config = broker.config();
        let Ok(mut target) = self.target.try_borrow_mut() else {
            tracing::warn!(
                message = "holder.busy",
                target = type_name::<T>(),
                source = source.source_kind().name(),
            );
            return None;
        };
        let backup = config.rollback_on_failure.then(|| target.clone());
        let result = if config.catch_panics {
            catch_unwind(AssertUnwindSafe(|| couple.apply(source, &mut target)))
                .unwrap_or_else(|payload| Err(UpdateError::panicked(payload.as_ref())))
        } else {
            couple.apply(source, &mut target)
        };
        if result.is_err()
            && let Some(backup) = backup
        {
            *target = backup;
        }
        Some(result)
    }

    /// Snapshot of the target when a change should cascade from it.
    fn cascade_snapshot(&self, broker: &Broker, trigger: SourceKind) -> Option<T> {
        let target = self.target.borrow();
        let own = target.as_source()?;
        // Self-loop guard: the trigger is this target's own kind or one of
        // its parents.
        if descends_from(own, trigger) {
            tracing::trace!(message = "holder.self_loop_guard", target = type_name::<T>());
            return None;
        }
        if !broker.is_interested(own.source_kind()) {
            return None;
        }
        Some(target.clone())
    }
}

impl<T: Target> Managed for HolderCell<T> {
    fn target_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn target_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn update_target(
        self: Rc<Self>,
        broker: &Broker,
        kind: SourceKind,
        source: &dyn Source,
        queue: &mut ChangeQueue,
        depth: usize,
    ) {
        let Some(couple) = self.couples.borrow().get(&kind).cloned() else {
            return;
        };

        let changed = match self.apply(broker, couple.as_ref(), source) {
            None => return,
            Some(Ok(changed)) => changed,
            Some(Err(error)) => {
                broker.stats_cell().record_failed();
                tracing::warn!(
                    message = "holder.update_failed",
                    target = type_name::<T>(),
                    source = kind.name(),
                    %error,
                );
                return;
            }
        };
        broker.stats_cell().record_applied(changed);
        if !changed {
            return;
        }

        let managed: Rc<dyn Managed> = Rc::clone(&self) as Rc<dyn Managed>;
        queue.push_unique(managed);

        if let Some(snapshot) = self.cascade_snapshot(broker, kind)
            && let Some(own) = snapshot.as_source()
        {
            broker.cascade(own, queue, depth + 1);
        }
    }

    fn on_changed(&self) -> EmitReport {
        self.revive();
        let snapshot = self.target.borrow().clone();
        let subject = self.subject.borrow().clone();
        self.notifications.set(self.notifications.get() + 1);
        subject.emit(&snapshot)
    }

    fn dispose(&self) {
        if self.disposed.get() {
            return;
        }
        self.disposed.set(true);
        let subject = self.subject.borrow().clone();
        subject.close();
        match self.target.try_borrow_mut() {
            Ok(mut target) => *target = T::default(),
            Err(_) => tracing::warn!(message = "holder.dispose_busy", target = type_name::<T>()),
        }
        tracing::debug!(message = "holder.dispose", target = type_name::<T>());
    }

    fn project(&self, capability: TypeId, out: &mut dyn Any) -> bool {
        let projectors = self.projectors.borrow();
        let Some((_, project)) = projectors.iter().find(|(id, _)| *id == capability) else {
            return false;
        };
        project(&self.target.borrow(), out);
        true
    }
}

// ─── Holder ──────────────────────────────────────────────────────────────────

/// Handle to the holder of target type `T` inside a broker.
///
/// Obtained from [`Broker::holder`]. Cloning creates another handle to the
/// same holder.
pub struct Holder<T: Target> {
    cell: Rc<HolderCell<T>>,
}

impl<T: Target> Clone for Holder<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: Target + fmt::Debug> fmt::Debug for Holder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holder")
            .field("target", &*self.cell.target.borrow())
            .field("sources", &self.coupled_sources())
            .field("disposed", &self.cell.disposed.get())
            .finish()
    }
}

impl<T: Target> Holder<T> {
    pub(crate) fn from_cell(cell: Rc<HolderCell<T>>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Rc<HolderCell<T>> {
        &self.cell
    }

    /// Snapshot of the current instance.
    #[must_use]
    pub fn get(&self) -> T {
        self.cell.revive();
        self.cell.target.borrow().clone()
    }

    /// Borrow the current instance.
    ///
    /// # Panics
    ///
    /// Panics if `f` replaces or updates this same target (re-entrant
    /// borrow).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.cell.revive();
        f(&self.cell.target.borrow())
    }

    /// A fresh ref-counted view of this holder's change stream.
    #[must_use]
    pub fn observe(&self) -> Stream<T> {
        self.cell.revive();
        Stream::publish(&self.cell.subject.borrow())
    }

    /// Register `couple` under `kind`.
    ///
    /// Fails on a duplicate key, leaving the existing coupling in place, or
    /// when the coupling consumes a different kind than `kind`.
    pub fn add_couple(&self, kind: SourceKind, couple: Rc<dyn Couple<T>>) -> Result<()> {
        self.cell.add_couple(kind, couple)
    }

    /// Whether a coupling is registered for `kind`.
    #[must_use]
    pub fn has_couple(&self, kind: SourceKind) -> bool {
        self.cell.has_couple(kind)
    }

    /// Source kinds with a registered coupling, in no particular order.
    #[must_use]
    pub fn coupled_sources(&self) -> Vec<SourceKind> {
        self.cell.couples.borrow().keys().copied().collect()
    }

    /// Close the stream and reset the instance to its default.
    pub fn dispose(&self) {
        self.cell.dispose();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cell.disposed.get()
    }

    /// Change notifications published so far.
    #[must_use]
    pub fn notification_count(&self) -> u64 {
        self.cell.notifications.get()
    }

    /// Whether both handles point at the same holder.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{Coupling, UpdateBy, Wiring};

    struct Score {
        value: i64,
    }
    impl Source for Score {}

    struct Bonus(i64);
    impl Source for Bonus {}

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Total {
        value: i64,
    }

    impl Target for Total {
        fn wire(wiring: &mut Wiring<Self>) {
            wiring.accepts::<Score>();
        }
    }

    impl UpdateBy<Score> for Total {
        fn update_by(&mut self, source: &Score) -> std::result::Result<bool, UpdateError> {
            self.value = source.value;
            Ok(true)
        }
    }

    impl UpdateBy<Bonus> for Total {
        fn update_by(&mut self, source: &Bonus) -> std::result::Result<bool, UpdateError> {
            if source.0 < 0 {
                self.value = -999;
                return Err(UpdateError::rejected("negative bonus"));
            }
            self.value += source.0;
            Ok(source.0 != 0)
        }
    }

    #[test]
    fn duplicate_coupling_is_rejected_and_first_kept() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        let err = holder
            .add_couple(SourceKind::of::<Score>(), Coupling::<Score, Total>::erased())
            .unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateCoupling { .. }));

        broker.update_by(&Score { value: 4 });
        assert_eq!(holder.get().value, 4);
    }

    #[test]
    fn coupling_under_wrong_key_is_rejected() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        let err = holder
            .add_couple(SourceKind::of::<Score>(), Coupling::<Bonus, Total>::erased())
            .unwrap_err();
        assert!(matches!(err, BrokerError::CouplingKindMismatch { .. }));
        assert_eq!(holder.coupled_sources(), vec![SourceKind::of::<Score>()]);
    }

    #[test]
    fn manual_coupling_needs_registration_to_receive_updates() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        holder
            .add_couple(SourceKind::of::<Bonus>(), Coupling::<Bonus, Total>::erased())
            .unwrap();

        // Coupled but not registered for Bonus: nothing happens.
        broker.update_by(&Bonus(5));
        assert_eq!(holder.get().value, 0);

        broker.register(SourceKind::of::<Bonus>(), &holder);
        broker.update_by(&Bonus(5));
        assert_eq!(holder.get().value, 5);
    }

    #[test]
    fn failed_update_rolls_back_and_stays_silent() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        holder
            .add_couple(SourceKind::of::<Bonus>(), Coupling::<Bonus, Total>::erased())
            .unwrap();
        broker.register(SourceKind::of::<Bonus>(), &holder);
        broker.update_by(&Score { value: 10 });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = holder
            .observe()
            .subscribe(move |t: &Total| sink.borrow_mut().push(t.value));

        broker.update_by(&Bonus(-1));
        assert_eq!(holder.get().value, 10);
        assert!(seen.borrow().is_empty());
        assert_eq!(broker.stats().updates_failed, 1);
    }

    #[test]
    fn unchanged_update_is_not_notified() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        holder
            .add_couple(SourceKind::of::<Bonus>(), Coupling::<Bonus, Total>::erased())
            .unwrap();
        broker.register(SourceKind::of::<Bonus>(), &holder);

        broker.update_by(&Bonus(0));
        assert_eq!(holder.notification_count(), 0);
        broker.update_by(&Bonus(2));
        assert_eq!(holder.notification_count(), 1);
    }

    #[test]
    fn dispose_resets_and_revives_without_rewiring() {
        let broker = Broker::new();
        let holder = broker.holder::<Total>();
        broker.update_by(&Score { value: 3 });

        holder.dispose();
        holder.dispose();
        assert!(holder.is_disposed());
        assert_eq!(holder.cell().target.borrow().value, 0);

        let _stream = holder.observe();
        assert!(!holder.is_disposed());
        assert_eq!(holder.coupled_sources(), vec![SourceKind::of::<Score>()]);
        broker.update_by(&Score { value: 8 });
        assert_eq!(holder.get().value, 8);
    }

    #[test]
    fn handles_share_one_holder() {
        let broker = Broker::new();
        let a = broker.holder::<Total>();
        let b = broker.holder::<Total>();
        assert!(a.ptr_eq(&b));
        assert!(format!("{a:?}").contains("Holder"));
    }
}
