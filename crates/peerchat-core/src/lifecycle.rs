//! Connection lifecycle state machine.
//!
//! Every state change goes through [`next_state`], the single table of legal
//! transitions. The manager owns the active channel handle and publishes the
//! current state on a watch channel so transfer loops can stop as soon as the
//! connection goes away.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::channel::ChannelHandle;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Local request to connect to a remote id
    Connect,
    /// Local request to reconnect to the last remote id
    Retry,
    /// An inbound channel finished opening
    IncomingOpen,
    /// The outgoing channel finished opening
    ChannelOpen,
    /// The channel or the peer session reported an error
    ChannelError,
    /// The channel closed from either end
    ChannelClose,
    /// Local request to close the connection
    Hangup,
}

/// The legal transition table
pub fn next_state(from: ConnectionState, event: LifecycleEvent) -> Option<ConnectionState> {
    use ConnectionState as S;
    use LifecycleEvent as E;

    match (from, event) {
        (S::Disconnected | S::Error | S::Closed, E::Connect) => Some(S::Connecting),
        (S::Error | S::Closed, E::Retry) => Some(S::Connecting),
        (S::Disconnected | S::Error | S::Closed, E::IncomingOpen) => Some(S::Connected),
        (S::Connecting, E::ChannelOpen) => Some(S::Connected),
        (S::Connecting | S::Connected, E::ChannelError) => Some(S::Error),
        (S::Connecting | S::Connected, E::ChannelClose) => Some(S::Closed),
        (_, E::Hangup) => Some(S::Closed),
        _ => None,
    }
}

/// Trim a user-entered remote id and reject empty or self ids
pub fn validate_remote_id(remote_id: &str, is_local: impl FnOnce(&str) -> bool) -> Result<String> {
    let remote_id = remote_id.trim();
    if remote_id.is_empty() {
        return Err(Error::Validation("remote id is empty".into()));
    }
    if is_local(remote_id) {
        return Err(Error::Validation("cannot connect to yourself".into()));
    }
    Ok(remote_id.to_string())
}

/// Owns the one logical connection of a session
pub struct ConnectionManager {
    state: ConnectionState,
    remote_id: Option<String>,
    last_remote_id: Option<String>,
    channel: Option<Arc<dyn ChannelHandle>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            remote_id: None,
            last_remote_id: None,
            channel: None,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// The id a retry would reconnect to
    pub fn last_remote_id(&self) -> Option<&str> {
        self.last_remote_id.as_deref()
    }

    /// The active channel, only while connecting or connected
    pub fn channel(&self) -> Option<&Arc<dyn ChannelHandle>> {
        self.channel.as_ref()
    }

    /// Watch the connection state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Check that `event` is legal right now, without applying it
    pub fn check(&self, event: LifecycleEvent) -> Result<ConnectionState> {
        next_state(self.state, event).ok_or(Error::InvalidTransition {
            from: self.state,
            event,
        })
    }

    /// Apply a transition that carries no channel.
    ///
    /// `Connect`, `Retry` and `IncomingOpen` bring a channel with them and go
    /// through [`begin`](Self::begin) or [`adopt`](Self::adopt) instead.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<ConnectionState> {
        let to = match event {
            LifecycleEvent::Connect | LifecycleEvent::Retry | LifecycleEvent::IncomingOpen => None,
            _ => next_state(self.state, event),
        }
        .ok_or(Error::InvalidTransition {
            from: self.state,
            event,
        })?;
        debug!(from = %self.state, to = %to, ?event, "connection transition");

        if matches!(to, ConnectionState::Error | ConnectionState::Closed) {
            if let Some(channel) = self.channel.take() {
                channel.close();
            }
            self.remote_id = None;
        }

        self.set_state(to);
        Ok(to)
    }

    /// Enter `Connecting` toward `remote_id` with a freshly opened channel.
    ///
    /// `event` is either `Connect` or `Retry`.
    pub fn begin(
        &mut self,
        event: LifecycleEvent,
        remote_id: &str,
        channel: Arc<dyn ChannelHandle>,
    ) -> Result<ConnectionState> {
        if !matches!(event, LifecycleEvent::Connect | LifecycleEvent::Retry) {
            return Err(Error::InvalidTransition {
                from: self.state,
                event,
            });
        }
        let to = self.check(event)?;
        self.remote_id = Some(remote_id.to_string());
        self.last_remote_id = Some(remote_id.to_string());
        self.channel = Some(channel);
        info!(remote_id = %remote_id, "connecting");
        self.set_state(to);
        Ok(to)
    }

    /// Adopt an inbound channel that has just opened
    pub fn adopt(&mut self, channel: Arc<dyn ChannelHandle>) -> Result<ConnectionState> {
        let to = self.check(LifecycleEvent::IncomingOpen)?;
        let remote_id = channel.remote_id().to_string();
        info!(remote_id = %remote_id, "accepted incoming connection");
        self.remote_id = Some(remote_id.clone());
        self.last_remote_id = Some(remote_id);
        self.channel = Some(channel);
        self.set_state(to);
        Ok(to)
    }

    fn set_state(&mut self, to: ConnectionState) {
        self.state = to;
        self.state_tx.send_replace(to);
    }
}
