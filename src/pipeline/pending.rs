use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

/// Shared liveness flag checked before every side effect of an async continuation.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that performed the cancellation.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        !self.is_cancelled()
    }
}

/// One-shot result of work running on another thread.
///
/// If the producer goes away without answering, the pending value settles to
/// the fallback produced by `on_abandon`.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<T>,
    on_abandon: fn() -> T,
}

/// Producing half of a [`Pending`].
#[derive(Debug)]
pub struct Resolver<T> {
    tx: Sender<T>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        // The waiting side may already be gone; nothing to do then.
        let _ = self.tx.send(value);
    }
}

impl<T> Pending<T> {
    pub fn channel(on_abandon: fn() -> T) -> (Resolver<T>, Self) {
        let (tx, rx) = bounded(1);
        (Resolver { tx }, Self { rx, on_abandon })
    }

    /// Non-blocking: `None` while the work is still running.
    pub fn try_get(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some((self.on_abandon)()),
        }
    }

    pub fn wait(&self) -> T {
        self.rx.recv().unwrap_or_else(|_| (self.on_abandon)())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some((self.on_abandon)()),
        }
    }

    /// For use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}
