//! Communication handles between the host and sandboxes.
//!
//! The host sees each mounted sandbox as a [`SandboxChannel`]; a sandbox
//! sees its host as a [`HostChannel`]. Both are fire-and-forget: `send`
//! never waits for the peer to process the message.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{HostMessage, SandboxMessage};

/// Why a message could not be handed to a peer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer is gone; the handle will never work again.
    #[error("channel closed")]
    Closed,
    /// The peer is not keeping up; this message was not queued.
    #[error("channel full")]
    Full,
}

/// Host → sandbox direction.
pub trait SandboxChannel: Send + Sync + 'static {
    fn send(&self, message: HostMessage) -> Result<(), ChannelError>;
}

/// Sandbox → host direction.
pub trait HostChannel: Send + Sync + 'static {
    fn post(&self, message: SandboxMessage) -> Result<(), ChannelError>;
}

/// Shared handle to one mounted sandbox.
pub type SandboxHandle = Arc<dyn SandboxChannel>;

/// Whether two handles refer to the same sandbox channel.
pub fn same_handle(a: &SandboxHandle, b: &SandboxHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Bounded tokio queue usable as either direction.
#[derive(Debug)]
pub struct QueueChannel<M> {
    tx: mpsc::Sender<M>,
}

impl<M> QueueChannel<M> {
    /// Create a channel and the receiver its peer reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn offer(&self, message: M) -> Result<(), ChannelError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

impl SandboxChannel for QueueChannel<HostMessage> {
    fn send(&self, message: HostMessage) -> Result<(), ChannelError> {
        self.offer(message)
    }
}

impl HostChannel for QueueChannel<SandboxMessage> {
    fn post(&self, message: SandboxMessage) -> Result<(), ChannelError> {
        self.offer(message)
    }
}
