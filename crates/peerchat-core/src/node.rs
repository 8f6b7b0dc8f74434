//! Peer session over iroh.
//!
//! Each channel is one bidirectional QUIC stream carrying length-prefixed
//! postcard frames. The dialing side writes a `Hello` frame first since QUIC
//! streams only materialize on the remote once data is sent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use iroh::endpoint::{Connection, Incoming, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelHandle, Payload, PeerSession, SessionEvent};
use crate::ticket::Ticket;
use crate::{Error, Result};

/// ALPN protocol identifier for peerchat
pub const PEERCHAT_ALPN: &[u8] = b"peerchat/1";

/// Largest frame accepted from the wire
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames sent over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Frame {
    /// First frame from the dialing side, carrying its ticket
    Hello { from: String },

    Text(String),

    Binary(Vec<u8>),

    /// A structured payload as JSON text
    Structured(String),
}

impl Frame {
    fn from_payload(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Frame::Text(text),
            Payload::Binary(data) => Frame::Binary(data.to_vec()),
            Payload::Structured(value) => Frame::Structured(value.to_string()),
        }
    }

    fn into_payload(self) -> Option<Payload> {
        match self {
            Frame::Hello { .. } => None,
            Frame::Text(text) => Some(Payload::Text(text)),
            Frame::Binary(data) => Some(Payload::Binary(Bytes::from(data))),
            Frame::Structured(json) => match serde_json::from_str(&json) {
                Ok(value) => Some(Payload::Structured(value)),
                Err(e) => {
                    debug!(error = %e, "dropping unparseable structured frame");
                    None
                }
            },
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            Frame::Hello { from } => from.len(),
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
            Frame::Structured(json) => json.len(),
        }
    }
}

/// A peer session bound to an iroh endpoint
pub struct IrohPeer {
    endpoint: Endpoint,
    ticket: String,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl IrohPeer {
    /// Bind a fresh endpoint and start accepting incoming channels
    pub async fn bind() -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        Self::with_secret_key(SecretKey::generate(&mut rand::rng())).await
    }

    pub async fn with_secret_key(
        secret_key: SecretKey,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![PEERCHAT_ALPN.to_vec()])
            .bind()
            .await?;

        // Wait for the endpoint to be online (connected to relay)
        endpoint.online().await;

        let ticket = Ticket::new(endpoint_addr(&endpoint)).serialize();
        info!(endpoint_id = %endpoint.id(), "peerchat endpoint started");

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(endpoint.clone(), session_tx.clone()));

        Ok((
            Self {
                endpoint,
                ticket,
                session_tx,
            },
            session_rx,
        ))
    }

    /// The ticket to share with the remote peer
    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    /// Shutdown the endpoint gracefully
    pub async fn shutdown(self) -> Result<()> {
        self.endpoint.close().await;
        Ok(())
    }
}

impl PeerSession for IrohPeer {
    fn local_id(&self) -> &str {
        &self.ticket
    }

    fn is_local(&self, remote_id: &str) -> bool {
        match Ticket::deserialize(remote_id) {
            Ok(ticket) => ticket.id() == self.endpoint.id(),
            Err(_) => remote_id.trim() == self.ticket,
        }
    }

    fn open(&self, remote_id: &str) -> Result<Channel> {
        let ticket = Ticket::deserialize(remote_id)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(IrohChannel::new(remote_id.trim(), frames_tx));

        let endpoint = self.endpoint.clone();
        let hello = Frame::Hello {
            from: self.ticket.clone(),
        };
        let channel = handle.clone();

        tokio::spawn(async move {
            debug!(endpoint_id = %ticket.id(), "dialing peer");
            match dial(&endpoint, &ticket, &hello).await {
                Ok((conn, send, recv)) => {
                    if !channel.attach(conn.clone()) {
                        conn.close(0u32.into(), b"hangup");
                        return;
                    }
                    let _ = events_tx.send(ChannelEvent::Open);
                    run_channel(send, recv, frames_rx, channel.buffered.clone(), events_tx).await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to open channel");
                    let _ = events_tx.send(ChannelEvent::Error(e.to_string()));
                }
            }
        });

        Ok(Channel::new(handle, events_rx))
    }

    fn reconnect(&self) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let session_tx = self.session_tx.clone();
        tokio::spawn(async move {
            endpoint.online().await;
            info!("endpoint back online");
            tokio::spawn(accept_loop(endpoint, session_tx));
        });
        Ok(())
    }
}

/// This endpoint's address, including direct socket addresses
fn endpoint_addr(endpoint: &Endpoint) -> EndpointAddr {
    let mut addr = endpoint.addr();
    for socket_addr in endpoint.bound_sockets() {
        addr = addr.with_ip_addr(socket_addr);
    }
    addr
}

async fn accept_loop(endpoint: Endpoint, session_tx: mpsc::UnboundedSender<SessionEvent>) {
    loop {
        let Some(incoming) = endpoint.accept().await else {
            warn!("endpoint stopped accepting connections");
            let _ = session_tx.send(SessionEvent::Disconnected);
            return;
        };

        let session_tx = session_tx.clone();
        tokio::spawn(async move {
            match accept_channel(incoming).await {
                Ok(channel) => {
                    let _ = session_tx.send(SessionEvent::Incoming(channel));
                }
                Err(e) => debug!(error = %e, "ignoring failed incoming connection"),
            }
        });
    }
}

async fn accept_channel(incoming: Incoming) -> Result<Channel> {
    let conn = incoming.accept()?.await?;
    if conn.alpn() != PEERCHAT_ALPN {
        return Err(Error::Protocol("unexpected ALPN".into()));
    }

    let (send, mut recv) = conn.accept_bi().await?;
    let Frame::Hello { from } = recv_frame(&mut recv).await? else {
        return Err(Error::Protocol("expected hello frame".into()));
    };
    debug!(remote = %from, "accepted channel");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(IrohChannel::new(&from, frames_tx));
    handle.attach(conn);

    let _ = events_tx.send(ChannelEvent::Open);
    tokio::spawn(run_channel(send, recv, frames_rx, handle.buffered.clone(), events_tx));

    Ok(Channel::new(handle, events_rx))
}

async fn dial(
    endpoint: &Endpoint,
    ticket: &Ticket,
    hello: &Frame,
) -> Result<(Connection, SendStream, RecvStream)> {
    let conn = endpoint.connect(ticket.addr.clone(), PEERCHAT_ALPN).await?;
    let (mut send, recv) = conn.open_bi().await?;
    send_frame(&mut send, hello).await?;
    Ok((conn, send, recv))
}

/// Pump frames both ways until either side of the stream ends
async fn run_channel(
    mut send: SendStream,
    mut recv: RecvStream,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    buffered: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        loop {
            match recv_frame(&mut recv).await {
                Ok(frame) => {
                    if let Some(payload) = frame.into_payload() {
                        let _ = reader_events.send(ChannelEvent::Data(payload));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "channel stream ended");
                    let _ = reader_events.send(ChannelEvent::Close);
                    return;
                }
            }
        }
    });

    while let Some(frame) = frames.recv().await {
        let len = frame.wire_len();
        let result = send_frame(&mut send, &frame).await;
        buffered.fetch_sub(len, Ordering::AcqRel);
        if let Err(e) = result {
            let _ = events.send(ChannelEvent::Error(e.to_string()));
            reader.abort();
            return;
        }
    }

    // The handle was closed; let queued data flush before the stream ends
    if let Err(e) = send.finish() {
        debug!(error = %e, "stream already finished");
    }
}

/// One end of an iroh channel
struct IrohChannel {
    remote_id: String,
    frames: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    conn: Mutex<Option<Connection>>,
    buffered: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl IrohChannel {
    fn new(remote_id: &str, frames: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            frames: Mutex::new(Some(frames)),
            conn: Mutex::new(None),
            buffered: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Record the established connection. Returns false if already closed.
    fn attach(&self, conn: Connection) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if let Ok(mut slot) = self.conn.lock() {
            *slot = Some(conn);
        }
        true
    }
}

impl ChannelHandle for IrohChannel {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, payload: Payload) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let frame = Frame::from_payload(payload);
        let len = frame.wire_len();

        let frames = self.frames.lock().map_err(|_| Error::ChannelClosed)?;
        let tx = frames.as_ref().ok_or(Error::ChannelClosed)?;
        self.buffered.fetch_add(len, Ordering::AcqRel);
        tx.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            Error::ChannelClosed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.take();
        }
        if let Some(conn) = self.conn.lock().ok().and_then(|mut c| c.take()) {
            conn.close(0u32.into(), b"hangup");
        }
        debug!(remote = %self.remote_id, "channel closed");
    }
}

/// Send a length-prefixed frame
async fn send_frame(stream: &mut SendStream, frame: &Frame) -> Result<()> {
    let bytes = postcard::to_allocvec(frame)
        .map_err(|e| Error::Protocol(format!("serialization error: {}", e)))?;

    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&bytes).await?;

    Ok(())
}

/// Receive a length-prefixed frame
async fn recv_frame(stream: &mut RecvStream) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol("frame too large".into()));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    postcard::from_bytes(&buf).map_err(|e| Error::Protocol(format!("deserialization error: {}", e)))
}
