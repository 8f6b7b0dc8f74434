//! The boundary with the peer-session library.
//!
//! A peer session hands out [`Channel`]s: an already-negotiated, ordered,
//! reliable, message-oriented link to one remote peer. Instead of registering
//! `on(event, handler)` closures, the owner of a channel pulls its
//! [`ChannelEvent`]s and feeds them into the connection state machine.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// One message on the data channel
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A UTF-8 string message
    Text(String),

    /// A raw binary message
    Binary(Bytes),

    /// Any other structured value the transport hands us
    Structured(serde_json::Value),
}

impl Payload {
    /// Number of bytes this payload occupies in the outgoing buffer
    pub fn wire_len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
            Payload::Structured(value) => value.to_string().len(),
        }
    }
}

/// Events raised by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Data(Payload),
    Close,
    Error(String),
}

/// Sending half of a channel
pub trait ChannelHandle: Send + Sync {
    /// Identifier of the peer on the other end
    fn remote_id(&self) -> &str;

    /// Queue a payload for delivery. Never blocks.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Bytes queued locally that have not been handed to the transport yet
    fn buffered_amount(&self) -> usize;

    /// Close the channel. Closing twice is a no-op.
    fn close(&self);
}

/// A channel handle plus the stream of events it raises
pub struct Channel {
    pub handle: Arc<dyn ChannelHandle>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub fn new(
        handle: Arc<dyn ChannelHandle>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { handle, events }
    }

    pub fn remote_id(&self) -> &str {
        self.handle.remote_id()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("remote_id", &self.handle.remote_id())
            .finish()
    }
}

/// Session-level notifications, distinct from any single data channel
#[derive(Debug)]
pub enum SessionEvent {
    /// A remote peer opened a channel to us
    Incoming(Channel),

    /// The session lost its signaling link
    Disconnected,

    /// The session reported an error of its own
    Error(String),
}

/// The peer-session library: owns signaling, hands out channels
pub trait PeerSession: Send + Sync {
    /// Identifier other peers use to reach us
    fn local_id(&self) -> &str;

    /// Whether `remote_id` refers to this peer
    fn is_local(&self, remote_id: &str) -> bool {
        remote_id.trim() == self.local_id()
    }

    /// Start opening a channel to `remote_id`.
    ///
    /// Returns immediately. The channel later raises either
    /// [`ChannelEvent::Open`] or [`ChannelEvent::Error`].
    fn open(&self, remote_id: &str) -> Result<Channel>;

    /// Re-establish the session's own signaling link
    fn reconnect(&self) -> Result<()>;
}
