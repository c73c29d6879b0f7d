//! Single-consumer mailbox over a [`ConcurrentQueue`].
//!
//! WHY: Socket readers and the pool coordinator deliver work as discrete
//! messages; the receiving thread blocks with a deadline until one arrives.
//!
//! WHAT: `mailbox()` returns a cloneable [`Sender`] and a [`Receiver`].
//! Senders unpark the thread parked in [`Receiver::recv_timeout`]. Dropping
//! the last sender, or the receiver, closes the queue; messages already queued
//! stay readable after close.

use concurrent_queue::{ConcurrentQueue, PopError, PushError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

struct Shared<T> {
    queue: ConcurrentQueue<T>,
    waiter: Mutex<Option<Thread>>,
    senders: AtomicUsize,
}

impl<T> Shared<T> {
    fn wake(&self) {
        let waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = waiter.as_ref() {
            thread.unpark();
        }
    }

    fn close(&self) -> bool {
        let closed = self.queue.close();
        self.wake();
        closed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverError {
    Timeout,
    Empty,
    Closed,
}

impl ReceiverError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReceiverError::Timeout)
    }
}

impl core::error::Error for ReceiverError {}

impl core::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReceiverError::Closed => write!(f, "ReceiverError::Closed"),
            ReceiverError::Timeout => write!(f, "ReceiverError::Timeout"),
            ReceiverError::Empty => write!(f, "ReceiverError::Empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderError<T> {
    Closed(T),
    Full(T),
}

impl<T> SenderError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SenderError::Closed(value) | SenderError::Full(value) => value,
        }
    }
}

impl<T: core::fmt::Debug> core::error::Error for SenderError<T> {}

impl<T: core::fmt::Debug> core::fmt::Display for SenderError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SenderError::Closed(value) => write!(f, "SenderError::Closed({value:?})"),
            SenderError::Full(value) => write!(f, "SenderError::Full({value:?})"),
        }
    }
}

pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

impl<T> Sender<T> {
    /// Queues a value and wakes the receiver.
    ///
    /// # Errors
    ///
    /// Hands the value back when the mailbox is closed or, for bounded
    /// mailboxes, full.
    pub fn send(&self, value: T) -> Result<(), SenderError<T>> {
        match self.shared.queue.push(value) {
            Ok(()) => {
                self.shared.wake();
                Ok(())
            }
            Err(PushError::Closed(value)) => Err(SenderError::Closed(value)),
            Err(PushError::Full(value)) => Err(SenderError::Full(value)),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn close(&self) -> bool {
        self.shared.close()
    }
}

pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.queue.close();
    }
}

impl<T> Receiver<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Takes the next value without blocking.
    ///
    /// # Errors
    ///
    /// [`ReceiverError::Empty`] when nothing is queued,
    /// [`ReceiverError::Closed`] when nothing is queued and never will be.
    pub fn try_recv(&self) -> Result<T, ReceiverError> {
        match self.shared.queue.pop() {
            Ok(value) => Ok(value),
            Err(PopError::Empty) => Err(ReceiverError::Empty),
            Err(PopError::Closed) => Err(ReceiverError::Closed),
        }
    }

    /// Blocks the current thread until a value arrives or `dur` elapses.
    ///
    /// # Errors
    ///
    /// [`ReceiverError::Timeout`] when the window passes with nothing queued,
    /// [`ReceiverError::Closed`] when the mailbox is closed and drained.
    pub fn recv_timeout(&self, dur: Duration) -> Result<T, ReceiverError> {
        let deadline = Instant::now() + dur;
        self.register_waiter(Some(thread::current()));

        let result = loop {
            match self.shared.queue.pop() {
                Ok(value) => break Ok(value),
                Err(PopError::Closed) => break Err(ReceiverError::Closed),
                Err(PopError::Empty) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(ReceiverError::Timeout);
                    }
                    thread::park_timeout(deadline - now);
                }
            }
        };

        self.register_waiter(None);
        result
    }

    fn register_waiter(&self, thread: Option<Thread>) {
        let mut waiter = self
            .shared
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *waiter = thread;
    }
}

fn with_queue<T>(queue: ConcurrentQueue<T>) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        queue,
        waiter: Mutex::new(None),
        senders: AtomicUsize::new(1),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// Creates an unbounded mailbox.
#[must_use]
pub fn mailbox<T>() -> (Sender<T>, Receiver<T>) {
    with_queue(ConcurrentQueue::unbounded())
}

/// Creates a mailbox holding at most `capacity` values.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    with_queue(ConcurrentQueue::bounded(capacity))
}
