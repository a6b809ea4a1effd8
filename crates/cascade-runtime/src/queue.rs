#![forbid(unsafe_code)]

//! Change queues and the reentrancy pool.
//!
//! A [`ChangeQueue`] collects the holders changed during one top-level pass,
//! each at most once, in first-enqueue order. Every top-level call takes its
//! own queue from the [`QueuePool`], so an update triggered from inside a
//! subscriber never reuses a queue that is still being flushed.
//!
//! Membership is a linear identity scan. Passes touch few holders; revisit
//! with a hashed set if that stops being true.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::holder::Managed;

/// FIFO of changed holders, deduplicated by identity.
pub(crate) struct ChangeQueue<H: ?Sized = dyn Managed> {
    entries: VecDeque<Rc<H>>,
}

impl<H: ?Sized> ChangeQueue<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Whether this exact holder is already queued.
    pub(crate) fn contains(&self, entry: &Rc<H>) -> bool {
        self.entries.iter().any(|queued| Rc::ptr_eq(queued, entry))
    }

    /// Enqueue unless already present. Returns whether it was added.
    pub(crate) fn push_unique(&mut self, entry: Rc<H>) -> bool {
        if self.contains(&entry) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    pub(crate) fn pop_front(&mut self) -> Option<Rc<H>> {
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Stack of free change queues.
pub(crate) struct QueuePool<H: ?Sized = dyn Managed> {
    free: Vec<ChangeQueue<H>>,
    allocated: usize,
}

impl<H: ?Sized> QueuePool<H> {
    pub(crate) fn new(preallocate: usize) -> Self {
        Self {
            free: (0..preallocate).map(|_| ChangeQueue::new()).collect(),
            allocated: preallocate,
        }
    }

    /// Take a free queue, allocating when the pool is empty.
    pub(crate) fn acquire(&mut self) -> ChangeQueue<H> {
        match self.free.pop() {
            Some(queue) => queue,
            None => {
                self.allocated += 1;
                tracing::trace!(message = "queue_pool.grow", allocated = self.allocated);
                ChangeQueue::new()
            }
        }
    }

    /// Return a queue to the pool, cleared.
    pub(crate) fn release(&mut self, mut queue: ChangeQueue<H>) {
        queue.clear();
        self.free.push(queue);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }
}
