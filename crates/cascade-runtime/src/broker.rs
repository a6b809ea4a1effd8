#![forbid(unsafe_code)]

//! The broker: type-indexed registry and propagation engine.
//!
//! A [`Broker`] maps each source kind to the holders interested in it and
//! owns one [`Holder`] per target type. An update walks the source's parent
//! chain, applies every registered coupling, lets changed targets that are
//! themselves sources cascade, and finally publishes one notification per
//! changed holder.
//!
//! # Invariants
//!
//! 1. All mutations of one top-level call complete before its first
//!    notification.
//! 2. A holder is notified at most once per top-level call, in the order it
//!    first changed.
//! 3. Interest lists hold each holder at most once per kind.
//! 4. Every top-level call drains its own queue; calls made from subscribers
//!    take a different queue from the pool.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Update error or panic | `UpdateBy::update_by` | Warn, roll back, no notification |
//! | Subscriber panic | observer callback | Error log, next subscriber runs |
//! | Cascade too deep | cycle between source targets | Error log, branch dropped |
//! | Unwired pair | `ensure_coupling` without holder | Debug log, `Inert` |
//! | Undeclared target | update before `declare` or first access | Source not applied to it |
//! | `release` from a subscriber | mid-flush | Holders still queued revive and publish their defaults |

use std::any::{Any, TypeId, type_name};
use std::borrow::Borrow;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use cascade_core::contract::Accepted;
use cascade_core::{Coupling, Source, SourceKind, Stream, Target, UpdateBy, Wiring};

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::holder::{Holder, HolderCell, Managed};
use crate::queue::{ChangeQueue, QueuePool};
use crate::stats::{BrokerStats, StatsCell};

/// Whether a source/target pair has a live coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CouplingStatus {
    /// Registered on the target's holder.
    Wired,
    /// No holder was interested when the pair was ensured.
    Inert,
}

struct BrokerInner {
    config: BrokerConfig,
    holders: RefCell<AHashMap<TypeId, Rc<dyn Any>>>,
    /// Every holder, in creation order.
    managed: RefCell<Vec<Rc<dyn Managed>>>,
    interest: RefCell<AHashMap<SourceKind, Vec<Rc<dyn Managed>>>>,
    couplings: RefCell<AHashMap<(TypeId, TypeId), CouplingStatus>>,
    pool: RefCell<QueuePool>,
    stats: StatsCell,
}

/// Registry of holders and the entry point for updates.
///
/// Cloning creates another handle to the same broker. Brokers are
/// single-threaded (`!Send`); create one per thread or test.
#[derive(Clone)]
pub struct Broker {
    inner: Rc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.inner.config)
            .field("holders", &self.holder_count())
            .field("kinds", &self.inner.interest.borrow().len())
            .finish()
    }
}

impl Broker {
    /// A broker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// A broker with `config`.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        let pool = QueuePool::new(config.queue_pool_size);
        Self {
            inner: Rc::new(BrokerInner {
                config,
                holders: RefCell::new(AHashMap::new()),
                managed: RefCell::new(Vec::new()),
                interest: RefCell::new(AHashMap::new()),
                couplings: RefCell::new(AHashMap::new()),
                pool: RefCell::new(pool),
                stats: StatsCell::default(),
            }),
        }
    }

    /// Startup registration list; see [`BrokerBuilder`].
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // ─── Holders ─────────────────────────────────────────────────────────

    /// The holder for target type `T`, created and wired on first access.
    ///
    /// Access after [`release`](Self::release) revives the holder's stream
    /// without repeating the wiring.
    pub fn holder<T: Target>(&self) -> Holder<T> {
        let cell = match self.lookup::<T>() {
            Some(cell) => cell,
            None => self.create_holder::<T>(),
        };
        cell.revive();
        Holder::from_cell(cell)
    }

    /// Create and wire the holder for `T` ahead of its first access.
    ///
    /// Sources pushed before a target is declared or accessed never reach
    /// it. Idempotent; chains for registration lists.
    pub fn declare<T: Target>(&self) -> &Self {
        if self.lookup::<T>().is_none() {
            self.create_holder::<T>();
        }
        self
    }

    fn lookup<T: Target>(&self) -> Option<Rc<HolderCell<T>>> {
        let any = self.inner.holders.borrow().get(&TypeId::of::<T>()).cloned()?;
        any.downcast::<HolderCell<T>>().ok()
    }

    fn create_holder<T: Target>(&self) -> Rc<HolderCell<T>> {
        let cell = Rc::new(HolderCell::<T>::new());
        let managed: Rc<dyn Managed> = Rc::clone(&cell) as Rc<dyn Managed>;
        self.inner
            .holders
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::clone(&cell) as Rc<dyn Any>);
        self.inner.managed.borrow_mut().push(Rc::clone(&managed));

        let mut wiring = Wiring::<T>::new();
        T::wire(&mut wiring);
        let (accepted, exposed) = wiring.into_parts();
        cell.install_projectors(exposed);
        for declared in &accepted {
            self.register_managed(declared.kind(), Rc::clone(&managed));
            self.attach_declared(&cell, declared);
        }

        tracing::debug!(
            message = "holder.init",
            target = type_name::<T>(),
            sources = accepted.len(),
        );
        cell
    }

    fn attach_declared<T: Target>(&self, cell: &HolderCell<T>, declared: &Accepted<T>) {
        let kind = declared.kind();
        if let Err(error) = cell.add_couple(kind, declared.make_coupling()) {
            tracing::warn!(
                message = "coupling.attach_failed",
                target = type_name::<T>(),
                source = kind.name(),
                %error,
            );
            return;
        }
        self.inner
            .couplings
            .borrow_mut()
            .insert((kind.id(), TypeId::of::<T>()), CouplingStatus::Wired);
    }

    /// Snapshot of the current `T`.
    #[must_use]
    pub fn get<T: Target>(&self) -> T {
        self.holder::<T>().get()
    }

    /// Borrow the current `T`.
    ///
    /// # Panics
    ///
    /// Panics if `f` updates or replaces `T` on this broker.
    pub fn with<T: Target, R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.holder::<T>().with(f)
    }

    /// Replace the current `T`.
    ///
    /// When the new value is itself a source, it immediately drives an update
    /// through this broker. Replacing alone does not notify `T`'s observers.
    pub fn set<T: Target>(&self, value: T) {
        let holder = self.holder::<T>();
        if let Some(snapshot) = holder.cell().replace(value)
            && let Some(source) = snapshot.as_source()
        {
            self.update_by_dyn(source);
        }
    }

    /// Change stream of `T`.
    #[must_use]
    pub fn observe<T: Target>(&self) -> Stream<T> {
        self.holder::<T>().observe()
    }

    /// Number of holders created so far.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.inner.managed.borrow().len()
    }

    /// Dispose every holder.
    ///
    /// Streams complete and targets reset to their defaults. Couplings and
    /// registrations survive, so the next access serves a fresh instance.
    pub fn release(&self) {
        let managed: Vec<Rc<dyn Managed>> = self.inner.managed.borrow().clone();
        for holder in &managed {
            holder.dispose();
        }
        tracing::debug!(message = "broker.release", holders = managed.len());
    }

    /// Snapshots of every target exposing capability `C`.
    ///
    /// Each holder contributes at most once, in creation order.
    #[must_use]
    pub fn query_all<C: ?Sized + 'static>(&self) -> Vec<Box<C>> {
        let managed: Vec<Rc<dyn Managed>> = self.inner.managed.borrow().clone();
        let mut out: Vec<Box<C>> = Vec::new();
        for holder in &managed {
            holder.project(TypeId::of::<C>(), &mut out);
        }
        out
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Register `holder` as interested in sources of `kind`.
    ///
    /// Idempotent. Only holders with a coupling for `kind` react.
    pub fn register<T: Target>(&self, kind: SourceKind, holder: &Holder<T>) {
        let managed: Rc<dyn Managed> = Rc::clone(holder.cell()) as Rc<dyn Managed>;
        self.register_managed(kind, managed);
    }

    fn register_managed(&self, kind: SourceKind, managed: Rc<dyn Managed>) {
        let mut interest = self.inner.interest.borrow_mut();
        let list = interest.entry(kind).or_default();
        if list.iter().any(|existing| Rc::ptr_eq(existing, &managed)) {
            return;
        }
        tracing::trace!(
            message = "broker.register",
            source = kind.name(),
            target = managed.target_name(),
        );
        list.push(managed);
    }

    /// Whether any holder is registered for `kind`.
    #[must_use]
    pub fn is_interested(&self, kind: SourceKind) -> bool {
        self.inner
            .interest
            .borrow()
            .get(&kind)
            .is_some_and(|list| !list.is_empty())
    }

    fn interested_in(&self, kind: SourceKind) -> Vec<Rc<dyn Managed>> {
        self.inner
            .interest
            .borrow()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Wire the `S` → `T` coupling onto an existing holder.
    ///
    /// Idempotent per pair: the first call decides the status and later calls
    /// return it. When no holder registered for `S` owns `T`, the pair stays
    /// [`CouplingStatus::Inert`]; a holder for `T` created later still wires
    /// its own declared sources.
    pub fn ensure_coupling<S, T>(&self) -> Result<CouplingStatus>
    where
        S: Source,
        T: UpdateBy<S>,
    {
        let key = (TypeId::of::<S>(), TypeId::of::<T>());
        if let Some(status) = self.inner.couplings.borrow().get(&key).copied() {
            return Ok(status);
        }

        let kind = SourceKind::of::<S>();
        let owned = self
            .interested_in(kind)
            .iter()
            .any(|managed| managed.target_type() == TypeId::of::<T>());
        let status = match self.lookup::<T>().filter(|_| owned) {
            Some(cell) => {
                cell.add_couple(kind, Coupling::<S, T>::erased())?;
                CouplingStatus::Wired
            }
            None => {
                tracing::debug!(
                    message = "coupling.inert",
                    source = kind.name(),
                    target = type_name::<T>(),
                );
                CouplingStatus::Inert
            }
        };
        self.inner.couplings.borrow_mut().insert(key, status);
        Ok(status)
    }

    /// Status recorded for the `S` → `T` pair, if any.
    #[must_use]
    pub fn coupling_status<S: Source, T: Target>(&self) -> Option<CouplingStatus> {
        self.inner
            .couplings
            .borrow()
            .get(&(TypeId::of::<S>(), TypeId::of::<T>()))
            .copied()
    }

    // ─── Updates ─────────────────────────────────────────────────────────

    /// Apply `source` to every interested holder, then notify.
    pub fn update_by<S: Source>(&self, source: &S) {
        self.run(|broker, queue| broker.update_by_internal(source, queue, 0));
    }

    /// [`update_by`](Self::update_by) for a source known only at runtime.
    pub fn update_by_dyn(&self, source: &dyn Source) {
        self.run(|broker, queue| broker.update_by_internal(source, queue, 0));
    }

    /// Apply every source in order into one pass, then notify each changed
    /// holder once.
    ///
    /// Accepts anything yielding `&dyn Source`, `Box<dyn Source>` or
    /// `Rc<dyn Source>`; bound a longer sequence with `take(n)`.
    pub fn update_by_all<I>(&self, sources: I)
    where
        I: IntoIterator,
        I::Item: Borrow<dyn Source>,
    {
        self.run(|broker, queue| {
            for item in sources {
                let source = Borrow::<dyn Source>::borrow(&item);
                broker.update_by_internal(source, queue, 0);
            }
        });
    }

    fn run(&self, apply: impl FnOnce(&Self, &mut ChangeQueue)) {
        let mut queue = self.inner.pool.borrow_mut().acquire();
        let span = tracing::debug_span!("broker.pass", changed = tracing::field::Empty);
        let _guard = span.enter();

        apply(self, &mut queue);
        span.record("changed", queue.len());
        self.inner.stats.record_pass();

        while let Some(holder) = queue.pop_front() {
            let report = holder.on_changed();
            self.inner.stats.record_notification();
            if report.failed > 0 {
                tracing::debug!(
                    message = "broker.notify_failures",
                    target = holder.target_name(),
                    failed = report.failed,
                );
            }
        }
        self.inner.pool.borrow_mut().release(queue);
    }

    /// Dispatch `source` along its parent chain into `queue`.
    pub(crate) fn update_by_internal(
        &self,
        source: &dyn Source,
        queue: &mut ChangeQueue,
        depth: usize,
    ) {
        let mut level = Some(source);
        while let Some(current) = level {
            let kind = current.source_kind();
            for holder in self.interested_in(kind) {
                holder.update_target(self, kind, current, queue, depth);
            }
            level = current.parent();
        }
    }

    /// Re-dispatch a changed target as a source, one level deeper.
    pub(crate) fn cascade(&self, source: &dyn Source, queue: &mut ChangeQueue, depth: usize) {
        let limit = self.inner.config.max_cascade_depth;
        if depth > limit {
            self.inner.stats.record_depth_limit();
            tracing::error!(
                message = "broker.cascade_depth_exceeded",
                source = source.source_kind().name(),
                depth,
                limit,
            );
            return;
        }
        self.inner.stats.record_cascade();
        self.update_by_internal(source, queue, depth);
    }

    pub(crate) fn stats_cell(&self) -> &StatsCell {
        &self.inner.stats
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let allocated = self.inner.pool.borrow().allocated();
        self.inner
            .stats
            .snapshot(u64::try_from(allocated).unwrap_or(u64::MAX))
    }
}

fn declare_target<T: Target>(broker: &Broker) {
    broker.declare::<T>();
}

/// Builds a [`Broker`] whose targets are all wired before the first update.
///
/// ```
/// # use cascade_core::{Source, Target, UpdateBy, UpdateError, Wiring};
/// # use cascade_runtime::{Broker, BrokerConfig};
/// # struct Tick(u32);
/// # impl Source for Tick {}
/// # #[derive(Clone, Default)]
/// # struct Clock(u32);
/// # impl Target for Clock {
/// #     fn wire(wiring: &mut Wiring<Self>) { wiring.accepts::<Tick>(); }
/// # }
/// # impl UpdateBy<Tick> for Clock {
/// #     fn update_by(&mut self, t: &Tick) -> Result<bool, UpdateError> { self.0 = t.0; Ok(true) }
/// # }
/// let broker = Broker::builder()
///     .config(BrokerConfig::default().with_max_cascade_depth(8))
///     .target::<Clock>()
///     .build();
/// broker.update_by(&Tick(3));
/// assert_eq!(broker.get::<Clock>().0, 3);
/// ```
#[derive(Debug, Default)]
#[must_use]
pub struct BrokerBuilder {
    config: BrokerConfig,
    targets: Vec<fn(&Broker)>,
}

impl BrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare `T` when the broker is built.
    pub fn target<T: Target>(mut self) -> Self {
        self.targets.push(declare_target::<T>);
        self
    }

    pub fn build(self) -> Broker {
        let broker = Broker::with_config(self.config);
        for declare in &self.targets {
            declare(&broker);
        }
        tracing::debug!(
            message = "broker.build",
            targets = self.targets.len(),
            holders = broker.holder_count(),
        );
        broker
    }
}
