use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU8, AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// How an outstanding command was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandCompletion {
    /// A matching response is in the command buffer.
    Responded,
    /// The response violated the protocol. The reason is in the command buffer.
    Rejected,
    /// The command was cancelled.
    Cancelled,
}

/// Wakes the single caller waiting for a command to complete.
pub struct CommandSignal {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl CommandSignal {
    const PENDING: u8 = 0;
    const RESPONDED: u8 = 1;
    const REJECTED: u8 = 2;
    const CANCELLED: u8 = 3;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            waker: AtomicWaker::new(),
        }
    }
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Relaxed);
    }
    pub fn signal(&self, completion: CommandCompletion) {
        self.state.store(
            match completion {
                CommandCompletion::Responded => Self::RESPONDED,
                CommandCompletion::Rejected => Self::REJECTED,
                CommandCompletion::Cancelled => Self::CANCELLED,
            },
            Ordering::Release,
        );
        self.waker.wake();
    }
    pub fn wait(&self) -> impl Future<Output = CommandCompletion> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.state.swap(Self::PENDING, Ordering::Acquire) {
                Self::PENDING => Poll::Pending,
                Self::RESPONDED => Poll::Ready(CommandCompletion::Responded),
                Self::REJECTED => Poll::Ready(CommandCompletion::Rejected),
                _ => Poll::Ready(CommandCompletion::Cancelled),
            }
        })
    }
}
impl Default for CommandSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
///
/// This is what the interrupt handler uses to notify the bus task.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queue signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Relaxed);
    }
    /// Check if signals are queued, that weren't awaited yet.
    pub fn is_pending(&self) -> bool {
        self.queued_signals.load(Ordering::Relaxed) != 0
    }
    /// Asynchronously wait for the next signal.
    pub async fn next(&self) {
        poll_fn(|cx| {
            let queued_signals = self.queued_signals.load(Ordering::Relaxed);
            if queued_signals == 0 {
                self.waker.register(cx.waker());
                Poll::Pending
            } else {
                self.queued_signals
                    .store(queued_signals - 1, Ordering::Relaxed);
                Poll::Ready(())
            }
        })
        .await
    }
}
impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the host from entering a low power mode, while the driver is busy.
///
/// The driver loop holds the lock for the duration of every message it processes. A low power
/// idle hook of the application should check [WakeLock::is_held] before sleeping.
pub struct WakeLock {
    holders: AtomicUsize,
}
impl WakeLock {
    pub const fn new() -> Self {
        Self {
            holders: AtomicUsize::new(0),
        }
    }
    pub fn acquire(&self) -> WakeLockGuard<'_> {
        self.holders.fetch_add(1, Ordering::AcqRel);
        WakeLockGuard { wake_lock: self }
    }
    pub fn is_held(&self) -> bool {
        self.holders.load(Ordering::Acquire) != 0
    }
}
impl Default for WakeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the [WakeLock] once dropped.
pub struct WakeLockGuard<'a> {
    wake_lock: &'a WakeLock,
}
impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.wake_lock.holders.fetch_sub(1, Ordering::AcqRel);
    }
}
