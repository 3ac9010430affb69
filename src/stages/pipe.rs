//! Shared output-channel plumbing for stage implementations.

use crate::error::{ChainError, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Mutex;

/// A stage's bounded output channel.
///
/// Wraps one sender/receiver pair so a stage can hand out reader handles,
/// push into the sequence, and close it exactly once. After `close`, sends
/// report the closed-pipe condition and readers drain whatever is buffered
/// before disconnecting.
pub(crate) struct Pipe<T> {
    tx: Mutex<Option<Sender<T>>>,
    rx: Mutex<Option<Receiver<T>>>,
}

impl<T> Pipe<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Blocking send, in emission order.
    pub(crate) fn send(&self, item: T) -> Result<()> {
        // Clone the sender out of the lock so a blocked send never holds it.
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(item).map_err(|_| ChainError::PipeClosed),
            None => Err(ChainError::PipeClosed),
        }
    }

    /// Non-blocking send; `Ok(false)` when the buffer is full.
    pub(crate) fn try_send(&self, item: T) -> Result<bool> {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => match tx.try_send(item) {
                Ok(()) => Ok(true),
                Err(crossbeam_channel::TrySendError::Full(_)) => Ok(false),
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                    Err(ChainError::PipeClosed)
                }
            },
            None => Err(ChainError::PipeClosed),
        }
    }

    /// A reader handle onto the sequence.
    ///
    /// After `close`, a fresh disconnected receiver, so late readers still
    /// observe a terminated sequence instead of blocking forever.
    pub(crate) fn receiver(&self) -> Receiver<T> {
        if let Ok(guard) = self.rx.lock()
            && let Some(rx) = guard.as_ref()
        {
            return rx.clone();
        }
        let (tx, rx) = bounded(0);
        drop(tx);
        rx
    }

    /// Closes the pipe. Dropping the internal receiver as well lets a
    /// sender blocked on a full buffer unwind once external readers are
    /// gone.
    pub(crate) fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.rx.lock() {
            guard.take();
        }
    }
}
