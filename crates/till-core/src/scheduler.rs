//! # Deferred Task Scheduler
//!
//! The "emit later" primitive behind deferred event delivery.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Deferred Event Delivery                              │
//! │                                                                         │
//! │  cart.set_quantity(id, 3)                                               │
//! │      │                                                                  │
//! │      ├── mutate item state                (synchronous)                 │
//! │      ├── schedule quantity/total/change   (queued, not delivered)       │
//! │      └── drain()                          (delivery, in schedule order) │
//! │                                                                         │
//! │  A batch of synchronous mutations inside one public operation           │
//! │  delivers its events once the mutation is complete, in the order        │
//! │  they were scheduled - listeners always observe settled state.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Single-threaded and cooperative: there is no parallel execution, so the
//! queue needs no synchronization beyond `RefCell`. Tasks enqueued while a
//! drain is running (e.g. by a listener reacting to an event) run in the same
//! drain, after the tasks already queued.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

#[derive(Default)]
struct SchedulerInner {
    queue: VecDeque<Task>,
    draining: bool,
}

/// A single-threaded FIFO work queue shared by a cart and its items.
///
/// Cloning yields another handle to the same queue; items adopt their owning
/// cart's scheduler so item and cart events share one ordered feed.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Scheduler::default()
    }

    /// Returns true if this handle and `other` share the same queue.
    pub(crate) fn same_queue(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Enqueues a task for the next drain.
    pub fn enqueue(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().queue.push_back(Box::new(task));
    }

    /// Number of tasks waiting for delivery.
    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Runs queued tasks in FIFO order until the queue is empty.
    ///
    /// Re-entrant calls (a listener draining during a drain) are no-ops; the
    /// outer drain picks up whatever the listener scheduled.
    pub fn drain(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        loop {
            // The borrow must end before the task runs: tasks enqueue more
            // tasks and deliver events into listener registries.
            let task = self.inner.borrow_mut().queue.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }

        self.inner.borrow_mut().draining = false;
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
