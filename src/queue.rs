//! Fixed-capacity multi-producer/multi-consumer queue.
//!
//! A full queue rejects the push and hands the item back; the scheduler uses
//! that as its only backpressure signal.

use crossbeam::queue::ArrayQueue;

/// A bounded, lock-free MPMC queue.
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at least `capacity` items.
    ///
    /// The capacity is rounded up to a power of two, with a minimum of 2.
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            inner: ArrayQueue::new(capacity.max(2).next_power_of_two()),
        }
    }

    /// Appends an item, or returns it back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    /// Removes the oldest available item, or returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(BoundedQueue::<u32>::new(0).capacity(), 2);
        assert_eq!(BoundedQueue::<u32>::new(1000).capacity(), 1024);
        assert_eq!(BoundedQueue::<u32>::new(1024).capacity(), 1024);
    }

    #[test]
    fn test_push_fails_when_full() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            assert!(queue.push(i).is_ok());
        }
        assert_eq!(queue.push(99), Err(99));
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.pop(), Some(0));
        assert!(queue.push(4).is_ok());
    }

    #[test]
    fn test_pop_empty() {
        let queue = BoundedQueue::<usize>::new(8);
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let queue = BoundedQueue::new(4);
        let mut expected = 0;
        for round in 0..10 {
            for i in 0..3 {
                queue.push(round * 3 + i).unwrap();
            }
            for _ in 0..3 {
                assert_eq!(queue.pop(), Some(expected));
                expected += 1;
            }
        }
    }

    #[test]
    fn test_drop_releases_items() {
        let marker = Arc::new(());
        {
            let queue = BoundedQueue::new(8);
            for _ in 0..5 {
                queue.push(marker.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&marker), 6);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;

        let queue = Arc::new(BoundedQueue::new(64));
        let seen: Arc<Vec<AtomicBool>> = Arc::new((0..TOTAL).map(|_| AtomicBool::new(false)).collect());
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        while let Err(back) = queue.push(item) {
                            item = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let seen = seen.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    while consumed.load(Ordering::SeqCst) < TOTAL {
                        if let Some(item) = queue.pop() {
                            let duplicate = seen[item].swap(true, Ordering::SeqCst);
                            assert!(!duplicate, "item {} dequeued twice", item);
                            consumed.fetch_add(1, Ordering::SeqCst);
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        for handle in consumers {
            handle.join().unwrap();
        }

        assert_eq!(consumed.load(Ordering::SeqCst), TOTAL);
        assert!(seen.iter().all(|flag| flag.load(Ordering::SeqCst)));
    }
}
