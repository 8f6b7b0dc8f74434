//! In-process peer sessions.
//!
//! Peers join a shared [`MemoryNetwork`] under a name and open channels to
//! each other by that name. Channels are pairs of unbounded queues, so
//! delivery is ordered and reliable, matching what the protocol expects from
//! a real data channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, ChannelEvent, ChannelHandle, Payload, PeerSession, SessionEvent};
use crate::{Error, Result};

/// Registry of in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SessionEvent>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under `id` and get its session events
    pub fn join(&self, id: &str) -> (MemoryPeer, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id.to_string(), tx);
        debug!(peer = %id, "joined memory network");

        let peer = MemoryPeer {
            id: id.to_string(),
            network: self.clone(),
            reconnects: AtomicU32::new(0),
        };
        (peer, rx)
    }

    /// Drop a peer's signaling link, as if its session lost connectivity
    pub fn disconnect(&self, id: &str) {
        if let Some(tx) = self.lock().get(id) {
            let _ = tx.send(SessionEvent::Disconnected);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<SessionEvent>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A peer on a [`MemoryNetwork`]
pub struct MemoryPeer {
    id: String,
    network: MemoryNetwork,
    reconnects: AtomicU32,
}

impl MemoryPeer {
    /// How many times the session asked to reconnect
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl PeerSession for MemoryPeer {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn open(&self, remote_id: &str) -> Result<Channel> {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let remote_session = self.network.lock().get(remote_id).cloned();

        let Some(remote_session) = remote_session else {
            let _ = local_tx.send(ChannelEvent::Error(format!(
                "peer {} is unavailable",
                remote_id
            )));
            return Ok(Channel::new(DetachedChannel::new(remote_id), local_rx));
        };

        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let local_end = Arc::new(MemoryChannel {
            remote_id: remote_id.to_string(),
            peer: remote_tx.clone(),
            own: local_tx.clone(),
            closed: closed.clone(),
        });
        let remote_end = Arc::new(MemoryChannel {
            remote_id: self.id.clone(),
            peer: local_tx.clone(),
            own: remote_tx.clone(),
            closed,
        });

        if remote_session
            .send(SessionEvent::Incoming(Channel::new(remote_end, remote_rx)))
            .is_err()
        {
            let _ = local_tx.send(ChannelEvent::Error(format!(
                "peer {} is unavailable",
                remote_id
            )));
            return Ok(Channel::new(local_end, local_rx));
        }

        let _ = remote_tx.send(ChannelEvent::Open);
        let _ = local_tx.send(ChannelEvent::Open);
        Ok(Channel::new(local_end, local_rx))
    }

    fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One end of an in-memory channel
struct MemoryChannel {
    remote_id: String,
    peer: mpsc::UnboundedSender<ChannelEvent>,
    own: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle for MemoryChannel {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, payload: Payload) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        self.peer
            .send(ChannelEvent::Data(payload))
            .map_err(|_| Error::ChannelClosed)
    }

    fn buffered_amount(&self) -> usize {
        0
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.peer.send(ChannelEvent::Close);
        let _ = self.own.send(ChannelEvent::Close);
    }
}

/// A channel with no peer behind it.
///
/// [`MemoryPeer::open`] hands one out when the remote peer is not on the
/// network, so the caller still gets a channel whose only event is `Error`.
/// It doubles as a scriptable stand-in for a real data channel when driving
/// a [`FileSender`](crate::transfer::FileSender) or
/// [`ConnectionManager`](crate::lifecycle::ConnectionManager) directly: it
/// records every payload sent on it and reports a configurable buffered
/// amount that drains by a fixed step each time it is read.
#[derive(Default)]
pub struct DetachedChannel {
    remote_id: String,
    sent: Mutex<Vec<Payload>>,
    closed: AtomicBool,
    buffered: AtomicUsize,
    drain_step: AtomicUsize,
    polls: AtomicUsize,
}

impl DetachedChannel {
    pub fn new(remote_id: &str) -> Arc<Self> {
        Arc::new(Self {
            remote_id: remote_id.to_string(),
            ..Default::default()
        })
    }

    /// Pretend `bytes` are queued, draining `step` bytes per poll
    pub fn set_buffered(&self, bytes: usize, step: usize) {
        self.buffered.store(bytes, Ordering::Relaxed);
        self.drain_step.store(step, Ordering::Relaxed);
    }

    /// How many times `buffered_amount` was read
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ChannelHandle for DetachedChannel {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(payload);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let step = self.drain_step.load(Ordering::Relaxed);
        let current = self.buffered.load(Ordering::Relaxed);
        self.buffered
            .store(current.saturating_sub(step), Ordering::Relaxed);
        current
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
