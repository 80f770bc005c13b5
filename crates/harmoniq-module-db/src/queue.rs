//! Fixed-capacity blocking FIFO shared between loader threads.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    tail: usize,
    count: usize,
}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn write(&mut self, value: T) {
        let capacity = self.capacity();
        self.slots[self.tail] = Some(value);
        self.tail = (self.tail + 1) % capacity;
        self.count += 1;
    }

    fn read(&mut self) -> Option<T> {
        let capacity = self.capacity();
        let head = (self.tail + capacity - self.count) % capacity;
        let value = self.slots[head].take();
        self.count -= 1;
        value
    }
}

/// A circular buffer with blocking `push`/`pop`.
///
/// `push` waits while the queue is full and `pop` waits while it is empty, so a
/// producer that outruns the consumers is throttled instead of growing memory.
/// Items come out in the order they went in.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be non-zero");
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            ring: Mutex::new(Ring {
                slots: slots.into_boxed_slice(),
                tail: 0,
                count: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Appends `value`, blocking while the queue is full.
    pub fn push(&self, value: T) {
        let mut ring = self.ring.lock();
        while ring.is_full() {
            self.not_full.wait(&mut ring);
        }
        ring.write(value);
        self.signal_after_push(&ring);
    }

    /// Appends `value` if there is room, handing it back otherwise.
    pub fn try_push(&self, value: T) -> Result<(), (QueueError, T)> {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            return Err((QueueError::Full, value));
        }
        ring.write(value);
        self.signal_after_push(&ring);
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut ring = self.ring.lock();
        loop {
            if ring.count > 0 {
                if let Some(value) = ring.read() {
                    self.signal_after_pop(&ring);
                    return value;
                }
            }
            self.not_empty.wait(&mut ring);
        }
    }

    /// Removes the oldest item without blocking.
    pub fn try_pop(&self) -> Result<T, QueueError> {
        let mut ring = self.ring.lock();
        if ring.count == 0 {
            return Err(QueueError::Empty);
        }
        let value = ring.read().ok_or(QueueError::Empty)?;
        self.signal_after_pop(&ring);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    fn signal_after_push(&self, ring: &Ring<T>) {
        self.not_empty.notify_one();
        if !ring.is_full() {
            self.not_full.notify_one();
        }
    }

    fn signal_after_pop(&self, ring: &Ring<T>) {
        self.not_full.notify_one();
        if ring.count > 0 {
            self.not_empty.notify_one();
        }
    }
}
