#![forbid(unsafe_code)]

//! Binders: a reusable handler attached to a target's change stream.
//!
//! A [`Binder`] keeps one handler and can bind and unbind it any number of
//! times, e.g. when the owning component is shown and hidden. An optional
//! liveness predicate ties deliveries to an owner's lifetime: once the owner
//! is gone, values are skipped and `bind` refuses.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use cascade_core::{Subscription, Target};

use crate::broker::Broker;

type Handler<T> = Rc<RefCell<dyn FnMut(&T)>>;
type Liveness = Rc<dyn Fn() -> bool>;

/// Handler for changes of target `T`, bindable on demand.
///
/// Dropping the binder disposes it.
pub struct Binder<T: Target> {
    broker: Broker,
    handler: Handler<T>,
    liveness: Option<Liveness>,
    subscription: Option<Subscription>,
    disposed: bool,
}

impl<T: Target> Binder<T> {
    /// An unbound binder running `handler` for each change of `T`.
    pub fn new(broker: &Broker, handler: impl FnMut(&T) + 'static) -> Self {
        Self {
            broker: broker.clone(),
            handler: Rc::new(RefCell::new(handler)),
            liveness: None,
            subscription: None,
            disposed: false,
        }
    }

    /// Deliver only while `alive` returns true.
    #[must_use]
    pub fn with_liveness(mut self, alive: impl Fn() -> bool + 'static) -> Self {
        self.liveness = Some(Rc::new(alive));
        self
    }

    /// Deliver only while `owner` has strong references.
    #[must_use]
    pub fn with_owner<O: 'static>(self, owner: &Rc<O>) -> Self {
        let weak: Weak<O> = Rc::downgrade(owner);
        self.with_liveness(move || weak.strong_count() > 0)
    }

    fn is_alive(&self) -> bool {
        self.liveness.as_ref().is_none_or(|alive| alive())
    }

    /// Subscribe the handler. Returns whether a new binding was made.
    pub fn bind(&mut self) -> bool {
        if self.disposed || self.subscription.is_some() {
            return false;
        }
        if !self.is_alive() {
            tracing::debug!(
                message = "binder.bind_refused",
                target = std::any::type_name::<T>(),
            );
            return false;
        }

        let handler = Rc::clone(&self.handler);
        let liveness = self.liveness.clone();
        let subscription = self.broker.observe::<T>().subscribe(move |value: &T| {
            if liveness.as_ref().is_some_and(|alive| !alive()) {
                tracing::trace!(message = "binder.owner_gone");
                return;
            }
            (&mut *handler.borrow_mut())(value);
        });
        self.subscription = Some(subscription);
        true
    }

    /// Drop the binding. Returns whether one existed.
    pub fn unbind(&mut self) -> bool {
        self.subscription.take().is_some()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.subscription.is_some()
    }

    /// Unbind for good. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.unbind();
        self.liveness = None;
        self.disposed = true;
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T: Target> Drop for Binder<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Target> fmt::Debug for Binder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binder")
            .field("target", &std::any::type_name::<T>())
            .field("bound", &self.is_bound())
            .field("disposed", &self.disposed)
            .finish()
    }
}
