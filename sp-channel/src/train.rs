//! Bounded channel actors push finished trajectories into.
//!
//! The manager's ingest thread drains it into the replay buffer; the timeout
//! on the draining side keeps the terminate flag checked even when no actor
//! is producing.

use std::sync::mpsc;
use std::time::Duration;

use sp_core::tensor::NamedTensors;

use crate::ChannelError;

#[derive(Clone)]
pub struct TrainSender {
    tx: mpsc::SyncSender<NamedTensors>,
}

pub struct TrainReceiver {
    rx: mpsc::Receiver<NamedTensors>,
    timeout: Duration,
}

/// Build the channel: `slots` bounds how many trajectories can queue between
/// the actors and the ingest thread.
pub fn train_channel(slots: usize, timeout: Duration) -> (TrainSender, TrainReceiver) {
    let (tx, rx) = mpsc::sync_channel(slots);
    (TrainSender { tx }, TrainReceiver { rx, timeout })
}

impl TrainSender {
    /// Push a finished trajectory, waiting if the queue is momentarily full.
    pub fn push(&self, trajectory: NamedTensors) -> Result<(), ChannelError> {
        self.tx
            .send(trajectory)
            .map_err(|_| ChannelError::Terminated)
    }

    /// Non-blocking push; `Ok(false)` when the queue is full.
    pub fn try_push(&self, trajectory: NamedTensors) -> Result<bool, ChannelError> {
        match self.tx.try_send(trajectory) {
            Ok(()) => Ok(true),
            Err(mpsc::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(ChannelError::Terminated),
        }
    }
}

impl TrainReceiver {
    /// Next queued trajectory; `Ok(None)` on timeout so the ingest loop can
    /// check for shutdown.
    pub fn drain_next(&self) -> Result<Option<NamedTensors>, ChannelError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(t) => Ok(Some(t)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ChannelError::Terminated),
        }
    }
}
