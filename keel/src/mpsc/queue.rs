//! Core lock-free unbounded MPSC queue algorithm.
//!
//! # Algorithm
//!
//! Dmitry Vyukov's non-intrusive MPSC node queue:
//!
//! - The queue is a singly linked list of heap nodes with a permanent stub
//!   at the consumer end
//! - Producers allocate a node, `swap` it into `head`, then link the previous
//!   head to it with a `Release` store of `prev.next`
//! - The consumer follows `tail.next`; the node it moves onto becomes the new
//!   stub and the old stub is freed
//!
//! A producer preempted between the `swap` and the link leaves the list
//! briefly disconnected. The consumer observes this as [`Pop::Inconsistent`]:
//! items exist but are not reachable yet.
//!
//! # Safety
//!
//! The producer side is lock-free for any number of concurrent producers.
//! The consumer side requires exactly one consumer (single consumer invariant).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Bounded spin applied when the consumer catches a producer mid-link.
const INCONSISTENT_SPIN_LIMIT: usize = 64;

/// A list node. The stub's `value` is logically uninitialized.
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
}

impl<T> Node<T> {
    fn alloc(value: MaybeUninit<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Result of a single consumer poll.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Pop<T> {
    /// An item was dequeued.
    Data(T),
    /// No items are queued.
    Empty,
    /// A producer has reserved a position but not linked it yet.
    Inconsistent,
}

/// Producer-side state.
#[repr(C)]
#[repr(align(64))]
struct ProducerState<T> {
    /// Most recently enqueued node. Producers `swap` this.
    head: AtomicPtr<Node<T>>,
    /// Items pushed and not yet popped. Incremented before publication so it
    /// never undercounts what the consumer can reach.
    len: AtomicUsize,
}

/// Consumer-side state.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState<T> {
    /// Current stub. Only the consumer reads or writes this.
    tail: UnsafeCell<*mut Node<T>>,
}

/// Core MPSC queue structure.
#[repr(C)]
pub(crate) struct Queue<T> {
    producer: ProducerState<T>,
    consumer: ConsumerState<T>,
}

impl<T> Queue<T> {
    /// Creates an empty queue holding only the stub node.
    pub(crate) fn new() -> Self {
        let stub = Node::alloc(MaybeUninit::uninit());
        Self {
            producer: ProducerState {
                head: AtomicPtr::new(stub),
                len: AtomicUsize::new(0),
            },
            consumer: ConsumerState {
                tail: UnsafeCell::new(stub),
            },
        }
    }

    /// Enqueues an item. Lock-free; safe from any number of threads.
    #[inline]
    pub(crate) fn push(&self, item: T) {
        let node = Node::alloc(MaybeUninit::new(item));
        self.producer.len.fetch_add(1, Ordering::Relaxed);
        let prev = self.producer.head.swap(node, Ordering::AcqRel);
        // SAFETY: `prev` is still allocated. The consumer frees a node only
        // after moving past it through a non-null `next`, and `prev.next`
        // stays null until this store.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Approximate number of queued items.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.producer.len.load(Ordering::Relaxed)
    }

    /// Attempts to dequeue one item.
    ///
    /// # Safety
    ///
    /// Only one thread may call this at a time (single consumer).
    #[inline]
    pub(crate) unsafe fn pop(&self) -> Pop<T> {
        // SAFETY: single consumer; nobody else touches `tail`.
        let tail = unsafe { *self.consumer.tail.get() };
        // SAFETY: `tail` is the live stub owned by the consumer.
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };

        if next.is_null() {
            return if ptr::eq(self.producer.head.load(Ordering::Acquire), tail) {
                Pop::Empty
            } else {
                Pop::Inconsistent
            };
        }

        // SAFETY: the Acquire load of `next` synchronizes with the producer's
        // Release link, so the node and its value are fully written. `next`
        // becomes the stub; its value is read exactly once here. The old stub
        // is unreachable by producers once its `next` is set.
        unsafe {
            *self.consumer.tail.get() = next;
            let item = (*next).value.assume_init_read();
            drop(Box::from_raw(tail));
            self.producer.len.fetch_sub(1, Ordering::Relaxed);
            Pop::Data(item)
        }
    }

    /// Dequeues one item, spinning briefly if a producer is mid-link.
    ///
    /// # Safety
    ///
    /// Same contract as [`Queue::pop`].
    #[inline]
    pub(crate) unsafe fn pop_settled(&self) -> Option<T> {
        for _ in 0..INCONSISTENT_SPIN_LIMIT {
            // SAFETY: forwarded from caller.
            match unsafe { self.pop() } {
                Pop::Data(item) => return Some(item),
                Pop::Empty => return None,
                Pop::Inconsistent => std::hint::spin_loop(),
            }
        }
        None
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no producer or consumer remains. The first
        // node is the stub (no live value); every node after it holds one.
        unsafe {
            let stub = *self.consumer.tail.get_mut();
            let mut next = (*stub).next.load(Ordering::Relaxed);
            drop(Box::from_raw(stub));
            while !next.is_null() {
                let node = next;
                next = (*node).next.load(Ordering::Relaxed);
                (*node).value.assume_init_drop();
                drop(Box::from_raw(node));
            }
        }
    }
}

// SAFETY: items are moved between threads, so `T: Send` is required. The
// raw pointers are owned by the queue.
unsafe impl<T: Send> Send for Queue<T> {}

// SAFETY: producers synchronize through `swap` on head and Release/Acquire on
// `next`; the consumer-only `tail` is guarded by the `pop` safety contract.
unsafe impl<T: Send> Sync for Queue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_fifo_single_producer() {
        let queue = Queue::new();
        queue.push(1u64);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);

        unsafe {
            assert_eq!(queue.pop(), Pop::Data(1));
            assert_eq!(queue.pop(), Pop::Data(2));
            assert_eq!(queue.pop(), Pop::Data(3));
            assert_eq!(queue.pop(), Pop::Empty);
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_empty_queue() {
        let queue: Queue<u64> = Queue::new();
        unsafe {
            assert_eq!(queue.pop(), Pop::Empty);
            assert_eq!(queue.pop_settled(), None);
        }
    }

    #[test]
    fn test_interleaved_push_pop() {
        let queue = Queue::new();
        queue.push(1u64);
        unsafe {
            assert_eq!(queue.pop_settled(), Some(1));
        }
        queue.push(2);
        queue.push(3);
        unsafe {
            assert_eq!(queue.pop_settled(), Some(2));
        }
        queue.push(4);
        unsafe {
            assert_eq!(queue.pop_settled(), Some(3));
            assert_eq!(queue.pop_settled(), Some(4));
            assert_eq!(queue.pop_settled(), None);
        }
    }

    #[test]
    fn test_drop_releases_queued_items() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = Queue::new();
            for _ in 0..5 {
                queue.push(Counted(Arc::clone(&drops)));
            }
            unsafe {
                drop(queue.pop_settled());
            }
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_multiple_producers() {
        let queue: Arc<Queue<u64>> = Arc::new(Queue::new());
        let num_producers = 4u64;
        let items_per_producer = 1000u64;

        let handles: Vec<_> = (0..num_producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..items_per_producer {
                        queue.push(p * 1_000_000 + i);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut items = Vec::new();
        while let Some(item) = unsafe { queue.pop_settled() } {
            items.push(item);
        }
        assert_eq!(items.len() as u64, num_producers * items_per_producer);

        // Per-producer FIFO order holds.
        for p in 0..num_producers {
            let own: Vec<u64> = items
                .iter()
                .copied()
                .filter(|v| v / 1_000_000 == p)
                .collect();
            let expected: Vec<u64> = (0..items_per_producer).map(|i| p * 1_000_000 + i).collect();
            assert_eq!(own, expected);
        }
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let queue: Arc<Queue<u64>> = Arc::new(Queue::new());
        let num_items = 10_000u64;

        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            for i in 0..num_items {
                producer_queue.push(i);
            }
        });

        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(num_items as usize);
            while (received.len() as u64) < num_items {
                match unsafe { consumer_queue.pop() } {
                    Pop::Data(item) => received.push(item),
                    Pop::Empty | Pop::Inconsistent => thread::yield_now(),
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, (0..num_items).collect::<Vec<_>>());
    }
}
