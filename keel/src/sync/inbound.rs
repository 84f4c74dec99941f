//! Unbounded MPSC queue for in-process (inter-thread) communication.
//!
//! # Overview
//!
//! - [`Producer`] - Write end. Cloneable and shareable; any thread may push.
//! - [`Consumer`] - Read end. Exactly one exists per queue.
//! - Lock-free: no mutexes or syscalls on either side
//!
//! A session's inbound queue is fed by network receive threads through the
//! producer while the session tick is the only consumer.
//!
//! # Example
//!
//! ```
//! use keel::sync::inbound;
//!
//! let (producer, consumer) = inbound::channel::<u64>();
//!
//! let remote = producer.clone();
//! std::thread::spawn(move || remote.push(7)).join().unwrap();
//! producer.push(8);
//!
//! assert_eq!(consumer.drain().collect::<Vec<_>>(), vec![7, 8]);
//! ```

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::mpsc::queue::Queue;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue.
///
/// `Producer` is [`Send`], [`Sync`] and [`Clone`]: pushes from any number of
/// threads are safe.
pub struct Producer<T: Send> {
    queue: Arc<Queue<T>>,
}

/// Read end of the queue.
///
/// # Thread Safety
///
/// `Consumer` is [`Send`] but **not** [`Sync`], and it is not `Clone`:
/// - Can transfer ownership to another thread
/// - Cannot share `&Consumer`, so at most one thread ever pops
pub struct Consumer<T: Send> {
    queue: Arc<Queue<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new unbounded channel.
///
/// Returns a `(Producer, Consumer)` pair.
#[must_use]
pub fn channel<T: Send>() -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(Queue::new());

    let producer = Producer {
        queue: Arc::clone(&queue),
    };
    let consumer = Consumer {
        queue,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Send> Producer<T> {
    /// Pushes an item. Never blocks and never fails.
    #[inline]
    pub fn push(&self, item: T) {
        self.queue.push(item);
    }

    /// Approximate number of items waiting to be consumed.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no items appear to be queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T: Send> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("len", &self.len()).finish()
    }
}

impl<T: Send> Consumer<T> {
    /// Pops the oldest item, or `None` if nothing is reachable.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: `Consumer` is neither `Sync` nor `Clone`, so this is the
        // only thread that can pop from the queue.
        unsafe { self.queue.pop_settled() }
    }

    /// Returns an iterator that pops until the queue is empty.
    ///
    /// The number of items yielded is capped at the queue length observed
    /// when `drain` is called, so producers that keep pushing cannot make
    /// a drain run forever. Items pushed after the snapshot stay queued for
    /// the next drain.
    #[inline]
    pub fn drain(&self) -> Drain<'_, T> {
        Drain {
            consumer: self,
            remaining: self.queue.len(),
        }
    }

    /// Approximate number of queued items.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no items appear to be queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("len", &self.len()).finish()
    }
}

/// Draining iterator returned by [`Consumer::drain`].
pub struct Drain<'a, T: Send> {
    consumer: &'a Consumer<T>,
    remaining: usize,
}

impl<T: Send> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.consumer.pop()?;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
