#![forbid(unsafe_code)]

//! Synchronous broadcast streams.
//!
//! - [`Broadcast`]: the multicast subject a holder publishes snapshots on.
//! - [`Stream`]: a ref-counted view of a subject. It connects upstream when
//!   its first subscriber arrives and disconnects when the last one leaves;
//!   the next subscriber reconnects.
//! - [`Subscription`]: RAII guard that unsubscribes on drop.
//!
//! # Invariants
//!
//! 1. Subscribers are called in registration order, in-line with `emit`.
//! 2. A subscriber only sees values emitted after it subscribed.
//! 3. A panicking subscriber is logged and skipped; the remaining subscribers
//!    still receive the value.
//! 4. A subscriber that is already running (re-entrant emission) is skipped
//!    for the nested value rather than borrowed twice.
//! 5. After [`Broadcast::close`], all subscribers are dropped and new
//!    subscriptions are inert.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::error::panic_message;

type Callback<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Slot<T> {
    id: u64,
    callback: Callback<T>,
}

struct SubjectState<T> {
    slots: RefCell<Vec<Slot<T>>>,
    next_id: Cell<u64>,
    closed: Cell<bool>,
}

impl<T> SubjectState<T> {
    fn remove(&self, id: u64) {
        // Take the removed slot out before dropping it so no borrow is held
        // while its captures run their destructors.
        let removed = {
            let mut slots = self.slots.borrow_mut();
            let position = slots.iter().position(|slot| slot.id == id);
            position.map(|idx| slots.remove(idx))
        };
        drop(removed);
    }
}

/// Outcome of one [`Broadcast::emit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Subscribers that ran to completion.
    pub delivered: usize,
    /// Subscribers that panicked.
    pub failed: usize,
    /// Subscribers skipped because they were already running.
    pub skipped: usize,
}

// ─── Broadcast ───────────────────────────────────────────────────────────────

/// Multicast subject.
///
/// Cloning creates another handle to the same subscriber list.
pub struct Broadcast<T> {
    state: Rc<SubjectState<T>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("subscribers", &self.state.slots.borrow().len())
            .field("closed", &self.state.closed.get())
            .finish()
    }
}

impl<T: 'static> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Broadcast<T> {
    /// Create an open subject with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(SubjectState {
                slots: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                closed: Cell::new(false),
            }),
        }
    }

    /// Register `callback` for future emissions.
    ///
    /// On a closed subject the returned subscription is inert.
    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> Subscription {
        if self.state.closed.get() {
            tracing::debug!(message = "stream.subscribe_closed");
            return Subscription::detached();
        }
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        let callback: Callback<T> = Rc::new(RefCell::new(callback));
        self.state.slots.borrow_mut().push(Slot { id, callback });

        let weak: Weak<SubjectState<T>> = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.remove(id);
            }
        })
    }

    /// Deliver `value` to every current subscriber.
    pub fn emit(&self, value: &T) -> EmitReport {
        let mut report = EmitReport::default();
        if self.state.closed.get() {
            return report;
        }

        // Snapshot so subscribers may (un)subscribe while being notified.
        let callbacks: Vec<Callback<T>> = self
            .state
            .slots
            .borrow()
            .iter()
            .map(|slot| Rc::clone(&slot.callback))
            .collect();

        for callback in callbacks {
            let Ok(mut callback) = callback.try_borrow_mut() else {
                tracing::warn!(message = "stream.reentrant_skip");
                report.skipped += 1;
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| (&mut *callback)(value))) {
                Ok(()) => report.delivered += 1,
                Err(payload) => {
                    report.failed += 1;
                    tracing::error!(
                        message = "stream.subscriber_panicked",
                        panic = %panic_message(payload.as_ref()),
                    );
                }
            }
        }
        report
    }

    /// Drop every subscriber and refuse new ones.
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.state.closed.set(true);
        let slots = std::mem::take(&mut *self.state.slots.borrow_mut());
        drop(slots);
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.slots.borrow().len()
    }

    fn downgrade(&self) -> Weak<SubjectState<T>> {
        Rc::downgrade(&self.state)
    }
}

// ─── Subscription ────────────────────────────────────────────────────────────

/// RAII guard for a stream subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a detach action run exactly once, on drop or
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn new(detach: impl FnOnce() + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A subscription with nothing to detach.
    pub fn detached() -> Self {
        Self { detach: None }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

// ─── Stream ──────────────────────────────────────────────────────────────────

struct SharedState<T> {
    upstream: Broadcast<T>,
    local: Broadcast<T>,
    connection: RefCell<Option<Subscription>>,
}

impl<T: 'static> SharedState<T> {
    fn connect(&self) {
        if self.connection.borrow().is_some() {
            return;
        }
        let local = self.local.downgrade();
        let connection = self.upstream.subscribe(move |value: &T| {
            if let Some(state) = local.upgrade() {
                Broadcast { state }.emit(value);
            }
        });
        *self.connection.borrow_mut() = Some(connection);
    }

    fn disconnect_if_idle(&self) {
        if self.local.subscriber_count() > 0 {
            return;
        }
        let connection = self.connection.borrow_mut().take();
        drop(connection);
    }
}

/// Ref-counted multicast view of a [`Broadcast`].
///
/// Cloning creates another handle to the same view.
pub struct Stream<T> {
    shared: Rc<SharedState<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("upstream", &self.shared.upstream)
            .field("connected", &self.shared.connection.borrow().is_some())
            .finish()
    }
}

impl<T: 'static> Stream<T> {
    /// A fresh, disconnected view of `upstream`.
    #[must_use]
    pub fn publish(upstream: &Broadcast<T>) -> Self {
        Self {
            shared: Rc::new(SharedState {
                upstream: upstream.clone(),
                local: Broadcast::new(),
                connection: RefCell::new(None),
            }),
        }
    }

    /// Subscribe to future values, connecting upstream if needed.
    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> Subscription {
        let inner = self.shared.local.subscribe(callback);
        self.shared.connect();
        let shared = Rc::clone(&self.shared);
        Subscription::new(move || {
            drop(inner);
            shared.disconnect_if_idle();
        })
    }

    /// Number of subscribers on this view.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.local.subscriber_count()
    }

    /// Whether this view currently holds an upstream connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connection.borrow().is_some()
    }
}
