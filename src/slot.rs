use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use event_listener::{Event, EventListener};
use futures_util::{FutureExt, Stream};
use parking_lot::Mutex;

use crate::error::{Disconnected, TimeoutError};

/// The observable state of a [`LatestValueSlot`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotState {
    /// No value is held.
    Empty,
    /// A value is held and has not been read since it was published.
    Fresh,
    /// A value is held but has already been read.
    Stale,
}

/// A single-item mailbox that always holds the most recently published value.
///
/// Publishing overwrites any value that has not been consumed yet. Consuming
/// moves the value out of the slot, so each published value is handed to at
/// most one consumer. Readers that only need a copy can use
/// [`Self::peek()`] or [`Self::read()`].
///
/// A slot can be [closed](Self::close). Closing releases every blocked
/// consumer: a fresh value is still delivered, but once the slot holds nothing
/// fresh, blocking consumes fail with [`Disconnected`].
#[derive(Debug)]
pub struct LatestValueSlot<T> {
    inner: Mutex<Inner<T>>,
    published: Event,
}

#[derive(Debug)]
struct Inner<T> {
    value: Option<T>,
    fresh: bool,
    closed: bool,
}

impl<T> Inner<T> {
    fn take_fresh(&mut self) -> Option<T> {
        if self.fresh {
            self.fresh = false;
            self.value.take()
        } else {
            None
        }
    }
}

enum Attempt<T> {
    Ready(T),
    Listen(Pin<Box<EventListener>>),
    Disconnected,
}

impl<T> Default for LatestValueSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatestValueSlot<T> {
    /// Returns a new, empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: None,
                fresh: false,
                closed: false,
            }),
            published: Event::new(),
        }
    }

    /// Stores `value` as the latest value and wakes every blocked consumer.
    /// Any previously stored value is dropped, whether or not it was consumed.
    pub fn publish(&self, value: T) {
        let replaced = {
            let mut inner = self.inner.lock();
            inner.fresh = true;
            inner.value.replace(value)
        };
        self.published.notify(usize::MAX);
        // The replaced value is dropped here, outside of the lock.
        drop(replaced);
    }

    /// Takes the stored value if it is fresh. Never blocks.
    #[must_use]
    pub fn try_consume(&self) -> Option<T> {
        self.inner.lock().take_fresh()
    }

    /// Takes the next fresh value, blocking the calling thread until one is
    /// published.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if the slot is closed and holds no fresh
    /// value.
    pub fn wait_consume(&self) -> Result<T, Disconnected> {
        self.wait_consume_with(|| {})
    }

    /// Like [`Self::wait_consume()`], but runs `on_take` under the slot's lock
    /// right before the value is taken, so anyone who sees the slot emptied
    /// also sees its effects. `on_take` must not touch the slot.
    pub(crate) fn wait_consume_with(&self, mut on_take: impl FnMut()) -> Result<T, Disconnected> {
        loop {
            match self.attempt_with(&mut on_take) {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Listen(mut listener) => listener.as_mut().wait(),
                Attempt::Disconnected => return Err(Disconnected),
            }
        }
    }

    /// Takes the next fresh value, blocking the calling thread until one is
    /// published or `duration` has elapsed.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: the slot is closed and holds no fresh
    ///   value.
    /// - [`TimeoutError::Timeout`]: nothing was published in time.
    pub fn wait_consume_timeout(&self, duration: Duration) -> Result<T, TimeoutError> {
        match Instant::now().checked_add(duration) {
            Some(deadline) => self.wait_consume_until(deadline),
            None => self.wait_consume().map_err(TimeoutError::from),
        }
    }

    /// Takes the next fresh value, blocking the calling thread until one is
    /// published or `deadline` is reached.
    ///
    /// # Errors
    ///
    /// - [`TimeoutError::Disconnected`]: the slot is closed and holds no fresh
    ///   value.
    /// - [`TimeoutError::Timeout`]: nothing was published in time.
    pub fn wait_consume_until(&self, deadline: Instant) -> Result<T, TimeoutError> {
        loop {
            match self.attempt() {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Listen(mut listener) => {
                    if Instant::now() >= deadline {
                        return Err(TimeoutError::Timeout);
                    }
                    // Whether this woke up or timed out, the next attempt
                    // decides.
                    let _ = listener.as_mut().wait_deadline(deadline);
                }
                Attempt::Disconnected => return Err(TimeoutError::Disconnected),
            }
        }
    }

    /// Takes the next fresh value, waiting asynchronously until one is
    /// published.
    ///
    /// The future is safe to cancel: no value is taken until it resolves.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if the slot is closed and holds no fresh
    /// value.
    pub async fn wait_consume_async(&self) -> Result<T, Disconnected> {
        loop {
            match self.attempt() {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Listen(listener) => {
                    listener.await;
                }
                Attempt::Disconnected => return Err(Disconnected),
            }
        }
    }

    /// Returns a copy of the stored value, fresh or not. The slot's freshness
    /// is unchanged.
    #[must_use]
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().value.clone()
    }

    /// Returns a copy of the stored value and marks it as read. Unlike
    /// [`Self::try_consume()`], the value stays in the slot.
    #[must_use]
    pub fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut inner = self.inner.lock();
        inner.fresh = false;
        inner.value.clone()
    }

    /// Marks the stored value as read without copying it.
    ///
    /// Returns true if the value was fresh.
    pub fn mark_read(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().fresh, false)
    }

    /// Returns the current state of the slot.
    #[must_use]
    pub fn state(&self) -> SlotState {
        let inner = self.inner.lock();
        match (&inner.value, inner.fresh) {
            (None, _) => SlotState::Empty,
            (Some(_), true) => SlotState::Fresh,
            (Some(_), false) => SlotState::Stale,
        }
    }

    /// Returns true if a value has been published since the last consume or
    /// read.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.inner.lock().fresh
    }

    /// Closes the slot and wakes every blocked consumer.
    ///
    /// Values can still be published and consumed without blocking, but
    /// blocking consumes no longer wait for them. Returns true if this call
    /// closed the slot.
    pub fn close(&self) -> bool {
        let was_closed = std::mem::replace(&mut self.inner.lock().closed, true);
        self.published.notify(usize::MAX);
        !was_closed
    }

    /// Returns true if the slot has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn attempt(&self) -> Attempt<T> {
        self.attempt_with(&mut || {})
    }

    fn attempt_with(&self, on_take: &mut dyn FnMut()) -> Attempt<T> {
        let mut inner = self.inner.lock();
        if inner.fresh {
            on_take();
        }
        if let Some(value) = inner.take_fresh() {
            Attempt::Ready(value)
        } else if inner.closed {
            Attempt::Disconnected
        } else {
            // The listener is registered while the lock is held, so a publish
            // can't slip in between the check and the wait.
            Attempt::Listen(self.published.listen())
        }
    }
}

/// Consumes values from a shared [`LatestValueSlot`] as a [`Stream`].
///
/// The stream yields each value it manages to consume and ends once the slot
/// is closed and drained. Values published faster than the stream is polled
/// are skipped.
#[derive(Debug)]
#[must_use]
pub struct SlotStream<T> {
    slot: Arc<LatestValueSlot<T>>,
    listener: Option<Pin<Box<EventListener>>>,
}

impl<T> SlotStream<T> {
    /// Returns a stream consuming from `slot`.
    pub fn new(slot: Arc<LatestValueSlot<T>>) -> Self {
        Self {
            slot,
            listener: None,
        }
    }

    /// Returns the slot this stream consumes from.
    #[must_use]
    pub fn into_inner(self) -> Arc<LatestValueSlot<T>> {
        self.slot
    }
}

impl<T> Stream for SlotStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(mut listener) = self.listener.take() {
                if listener.poll_unpin(cx).is_pending() {
                    self.listener = Some(listener);
                    return Poll::Pending;
                }
            }

            match self.slot.attempt() {
                Attempt::Ready(value) => return Poll::Ready(Some(value)),
                Attempt::Listen(listener) => self.listener = Some(listener),
                Attempt::Disconnected => return Poll::Ready(None),
            }
        }
    }
}

#[test]
fn latest_wins() {
    let slot = LatestValueSlot::new();
    assert_eq!(slot.state(), SlotState::Empty);
    for i in 1_u32..=10 {
        slot.publish(i);
    }
    assert_eq!(slot.state(), SlotState::Fresh);
    assert_eq!(slot.try_consume(), Some(10));
    assert_eq!(slot.state(), SlotState::Empty);
    assert_eq!(slot.try_consume(), None);
}

#[test]
fn try_consume_does_not_block() {
    let slot = LatestValueSlot::<String>::new();
    let start = Instant::now();
    assert!(slot.try_consume().is_none());
    slot.publish(String::from("hello"));
    assert_eq!(slot.try_consume().as_deref(), Some("hello"));
    assert!(slot.try_consume().is_none());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn peek_and_read() {
    let slot = LatestValueSlot::new();
    assert_eq!(slot.peek(), None);
    slot.publish(1_u32);
    // Peeking shouldn't change the freshness.
    assert_eq!(slot.peek(), Some(1));
    assert!(slot.is_fresh());
    // Reading keeps the value, but it is no longer new.
    assert_eq!(slot.read(), Some(1));
    assert_eq!(slot.state(), SlotState::Stale);
    assert_eq!(slot.try_consume(), None);
    assert_eq!(slot.peek(), Some(1));
    assert!(!slot.mark_read());
    slot.publish(2);
    assert!(slot.mark_read());
    assert_eq!(slot.peek(), Some(2));
}

#[test]
fn wait_blocks_until_first_publish() {
    let slot = Arc::new(LatestValueSlot::new());
    let consumer = std::thread::spawn({
        let slot = slot.clone();
        move || slot.wait_consume().unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());
    slot.publish(42_u32);
    assert_eq!(consumer.join().unwrap(), 42);
    assert_eq!(slot.state(), SlotState::Empty);
}

#[test]
fn timeouts() {
    let slot = LatestValueSlot::<u32>::new();
    let start = Instant::now();
    assert_eq!(
        slot.wait_consume_timeout(Duration::from_millis(100)),
        Err(TimeoutError::Timeout)
    );
    assert_eq!(
        slot.wait_consume_until(Instant::now() + Duration::from_millis(100)),
        Err(TimeoutError::Timeout)
    );
    // Leave a little slack for coarse timers.
    assert!(start.elapsed().as_millis() >= 180);

    slot.publish(7);
    assert_eq!(slot.wait_consume_timeout(Duration::from_secs(1)), Ok(7));
}

#[test]
fn close_releases_waiters() {
    let slot = Arc::new(LatestValueSlot::<u32>::new());
    let waiters = (0..3)
        .map(|_| {
            let slot = slot.clone();
            std::thread::spawn(move || slot.wait_consume_timeout(Duration::from_secs(15)))
        })
        .collect::<Vec<_>>();

    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    assert!(slot.close());
    assert!(!slot.close());
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Err(TimeoutError::Disconnected));
    }
    assert!(start.elapsed().as_secs() < 1);
}

#[test]
fn close_delivers_fresh_value_first() {
    let slot = LatestValueSlot::new();
    slot.publish(1_u32);
    slot.close();
    assert!(slot.is_closed());
    assert_eq!(slot.wait_consume(), Ok(1));
    assert_eq!(slot.wait_consume(), Err(Disconnected));
    // Publishing still works, it just no longer wakes anyone.
    slot.publish(2);
    assert_eq!(slot.try_consume(), Some(2));
}

#[test]
fn take_hook_runs_once_per_value() {
    let slot = LatestValueSlot::new();
    let mut taken = 0;
    slot.publish(7_u8);
    assert_eq!(slot.wait_consume_with(|| taken += 1), Ok(7));
    slot.close();
    assert_eq!(slot.wait_consume_with(|| taken += 1), Err(Disconnected));
    assert_eq!(taken, 1);
}

#[test]
fn readers_never_see_torn_values() {
    let slot = Arc::new(LatestValueSlot::<Vec<u32>>::new());
    let readers = (0..4)
        .map(|_| {
            let slot = slot.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                while let Ok(value) = slot.wait_consume() {
                    assert!(value.iter().all(|v| *v == value[0]));
                    assert_eq!(value.len(), 64);
                    last = last.max(value[0]);
                }
                last
            })
        })
        .collect::<Vec<_>>();

    for i in 1..=10_000 {
        slot.publish(vec![i; 64]);
    }
    slot.close();

    for reader in readers {
        assert!(reader.join().unwrap() <= 10_000);
    }
}

#[cfg(test)]
#[tokio::test(flavor = "multi_thread")]
async fn stream_test() {
    use futures_util::StreamExt;

    let slot = Arc::new(LatestValueSlot::new());
    let mut stream = SlotStream::new(slot.clone());
    let consumer = tokio::task::spawn(async move {
        let mut last_value = 0;
        while let Some(value) = stream.next().await {
            assert!(value > last_value);
            last_value = value;
        }
        // Polling a finished stream is harmless.
        assert!(stream.next().await.is_none());
        last_value
    });

    for i in 1..=1000_u32 {
        slot.publish(i);
        if i % 100 == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    slot.close();

    assert_eq!(consumer.await.unwrap(), 1000);
}

#[cfg(test)]
#[tokio::test(flavor = "multi_thread")]
async fn async_consume() {
    let slot = Arc::new(LatestValueSlot::new());
    let consumer = tokio::task::spawn({
        let slot = slot.clone();
        async move { slot.wait_consume_async().await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    slot.publish(String::from("async"));
    assert_eq!(consumer.await.unwrap().unwrap(), "async");

    slot.close();
    assert_eq!(slot.wait_consume_async().await, Err(Disconnected));
}
