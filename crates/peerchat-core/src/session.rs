//! The chat session: one peer session, one logical connection.
//!
//! `ChatSession` owns the connection state machine, the incoming transfer and
//! the media state, and is the only place channel events are applied. Callers
//! drive it by awaiting [`ChatSession::next_input`] and passing the result to
//! [`ChatSession::handle_input`] (or simply calling [`ChatSession::step`]),
//! and observe it through the [`UiEvent`] stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelHandle, PeerSession, SessionEvent};
use crate::config::TransferConfig;
use crate::lifecycle::{validate_remote_id, ConnectionManager, ConnectionState, LifecycleEvent};
use crate::media::MediaSessionState;
use crate::protocol::{classify, encode_chat, ControlMessage, FileHeader, Inbound};
use crate::transfer::{Diagnostic, FileSender, IncomingTransfer, ReceiveEvent, ReceivedFile, SendReport};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOrigin {
    Local,
    Remote,
}

/// Everything the user interface gets told about
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status {
        state: ConnectionState,
        message: String,
    },
    Chat {
        text: String,
        origin: ChatOrigin,
    },
    SendProgress(u8),
    ReceiveProgress(u8),
    FileReady(ReceivedFile),
    Diagnostic(Diagnostic),
    /// Session-level news that does not change the connection state
    SessionNotice(String),
}

/// One unit of work for the session
#[derive(Debug)]
pub enum SessionInput {
    /// An event on the active channel
    Channel(ChannelEvent),
    /// An event on an inbound channel that has not opened yet
    Pending(ChannelEvent),
    Session(SessionEvent),
}

pub struct ChatSession<P: PeerSession> {
    peer: P,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    connection: ConnectionManager,
    channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    pending: Option<Channel>,
    incoming: IncomingTransfer,
    media: MediaSessionState,
    config: TransferConfig,
    /// Set while a `FileUpload` is alive
    uploading: Arc<AtomicBool>,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl<P: PeerSession> ChatSession<P> {
    /// Create a session over `peer`. Returns the session and its UI event stream.
    pub fn new(
        peer: P,
        session_events: mpsc::UnboundedReceiver<SessionEvent>,
        config: TransferConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UiEvent>)> {
        config.validate()?;
        let (ui, ui_rx) = mpsc::unbounded_channel();

        info!(local_id = %peer.local_id(), "chat session ready");

        let session = Self {
            peer,
            session_events: Some(session_events),
            connection: ConnectionManager::new(),
            channel_events: None,
            pending: None,
            incoming: IncomingTransfer::new(),
            media: MediaSessionState::new(),
            config,
            uploading: Arc::new(AtomicBool::new(false)),
            ui,
        };
        Ok((session, ui_rx))
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    /// Hang up and hand back the peer session, e.g. to shut it down
    pub fn into_peer(mut self) -> P {
        self.hangup();
        self.peer
    }

    pub fn local_id(&self) -> &str {
        self.peer.local_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.connection.remote_id()
    }

    pub fn incoming(&self) -> &IncomingTransfer {
        &self.incoming
    }

    pub fn media(&self) -> &MediaSessionState {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut MediaSessionState {
        &mut self.media
    }

    /// Start connecting to `remote_id`
    pub fn connect(&mut self, remote_id: &str) -> Result<()> {
        let remote_id = validate_remote_id(remote_id, |id| self.peer.is_local(id))
            .inspect_err(|e| warn!(error = %e, "rejected connect request"))?;
        self.connection.check(LifecycleEvent::Connect)?;

        let channel = self.open_channel(&remote_id)?;
        self.begin(LifecycleEvent::Connect, &remote_id, channel)
    }

    /// Reconnect to the last remote id after an error or close
    pub fn retry(&mut self) -> Result<()> {
        let remote_id = self
            .connection
            .last_remote_id()
            .ok_or_else(|| Error::Validation("no previous peer to retry".into()))?
            .to_string();
        self.connection.check(LifecycleEvent::Retry)?;

        let channel = self.open_channel(&remote_id)?;
        self.begin(LifecycleEvent::Retry, &remote_id, channel)
    }

    /// Open a channel. An id the peer session cannot parse is a validation error.
    fn open_channel(&self, remote_id: &str) -> Result<Channel> {
        self.peer.open(remote_id).map_err(|e| match e {
            Error::InvalidTicket(reason) => {
                warn!(remote_id = %remote_id, reason = %reason, "rejected connect request");
                Error::Validation(format!("invalid remote id: {}", reason))
            }
            other => other,
        })
    }

    fn begin(&mut self, event: LifecycleEvent, remote_id: &str, channel: Channel) -> Result<()> {
        let Channel { handle, events } = channel;
        self.connection.begin(event, remote_id, handle)?;
        self.channel_events = Some(events);
        self.status(
            ConnectionState::Connecting,
            format!("connecting to {}", remote_id),
        );
        Ok(())
    }

    /// Close the connection. Calling it again is harmless.
    pub fn hangup(&mut self) {
        let was = self.connection.state();
        if let Some(pending) = self.pending.take() {
            pending.handle.close();
        }
        if self.connection.apply(LifecycleEvent::Hangup).is_ok() {
            self.teardown();
            if was != ConnectionState::Closed {
                info!("hung up");
                self.status(ConnectionState::Closed, "connection closed".into());
            }
        }
    }

    /// Send a chat line to the remote peer
    pub fn send_chat(&mut self, text: &str) -> Result<()> {
        let channel = self.connected_channel()?;
        if let Err(e) = channel.send(encode_chat(text)) {
            self.fail(e.to_string());
            return Err(e);
        }
        self.emit(UiEvent::Chat {
            text: text.to_string(),
            origin: ChatOrigin::Local,
        });
        Ok(())
    }

    /// Prepare an upload that can run alongside the session loop.
    ///
    /// Only one upload exists at a time; the slot frees up when the returned
    /// `FileUpload` is dropped or finishes.
    pub fn upload(&self) -> Result<FileUpload> {
        let channel = self.connected_channel()?;
        if self.uploading.swap(true, Ordering::AcqRel) {
            return Err(Error::TransferFailed("a file is already being sent".into()));
        }
        Ok(FileUpload {
            sender: FileSender::new(channel, self.connection.subscribe(), self.config.clone()),
            ui: self.ui.clone(),
            _slot: UploadSlot(self.uploading.clone()),
        })
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::Acquire)
    }

    fn connected_channel(&self) -> Result<Arc<dyn ChannelHandle>> {
        match (self.connection.state(), self.connection.channel()) {
            (ConnectionState::Connected, Some(channel)) => Ok(channel.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Wait for the next channel or session event.
    ///
    /// Returns `None` once there is nothing left that could produce one.
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        loop {
            if self.channel_events.is_none()
                && self.pending.is_none()
                && self.session_events.is_none()
            {
                return None;
            }

            tokio::select! {
                event = recv_or_wait(&mut self.channel_events) => {
                    return Some(SessionInput::Channel(event.unwrap_or_else(|| {
                        self.channel_events = None;
                        ChannelEvent::Close
                    })));
                }
                event = recv_pending(&mut self.pending) => {
                    return Some(SessionInput::Pending(event.unwrap_or(ChannelEvent::Close)));
                }
                event = recv_or_wait(&mut self.session_events) => match event {
                    Some(event) => return Some(SessionInput::Session(event)),
                    None => self.session_events = None,
                },
            }
        }
    }

    pub fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Channel(event) => self.handle_channel_event(event),
            SessionInput::Pending(event) => self.handle_pending_event(event),
            SessionInput::Session(event) => self.handle_session_event(event),
        }
    }

    /// Process one input. Returns `false` once the session has nothing left to wait on.
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.handle_input(input);
                true
            }
            None => false,
        }
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                if self.transition(LifecycleEvent::ChannelOpen) {
                    let remote = self.remote_id().unwrap_or_default().to_string();
                    info!(remote_id = %remote, "connected");
                    self.status(ConnectionState::Connected, format!("connected to {}", remote));
                }
            }
            ChannelEvent::Data(payload) => {
                if self.connection.state() != ConnectionState::Connected {
                    debug!(state = %self.connection.state(), "dropping data outside a connection");
                    return;
                }
                self.handle_inbound(classify(payload));
            }
            ChannelEvent::Close => {
                if self.transition(LifecycleEvent::ChannelClose) {
                    info!("connection closed by channel");
                    self.teardown();
                    self.status(ConnectionState::Closed, "connection closed".into());
                }
            }
            ChannelEvent::Error(message) => self.fail(message),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let events = match inbound {
            Inbound::ChatText(text) => {
                self.emit(UiEvent::Chat {
                    text,
                    origin: ChatOrigin::Remote,
                });
                return;
            }
            Inbound::Control(ControlMessage::FileHeader(header)) => self.incoming.on_header(header),
            Inbound::Control(ControlMessage::FileEnd) => self.incoming.on_end(),
            Inbound::BinaryChunk(data) => self.incoming.on_chunk(data),
            Inbound::UnknownFormat(shape) => {
                warn!(shape = %shape, "dropping payload of unknown format");
                vec![ReceiveEvent::Diagnostic(Diagnostic::UnknownPayload(shape))]
            }
        };

        for event in events {
            let event = match event {
                ReceiveEvent::Progress(pct) => UiEvent::ReceiveProgress(pct),
                ReceiveEvent::FileReady(file) => UiEvent::FileReady(file),
                ReceiveEvent::Diagnostic(diagnostic) => UiEvent::Diagnostic(diagnostic),
            };
            self.emit(event);
        }
    }

    fn handle_pending_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                let Some(Channel { handle, events }) = self.pending.take() else {
                    return;
                };
                let remote = handle.remote_id().to_string();
                match self.connection.adopt(handle.clone()) {
                    Ok(_) => {
                        self.channel_events = Some(events);
                        self.status(ConnectionState::Connected, format!("connected with {}", remote));
                    }
                    Err(e) => {
                        debug!(error = %e, "refusing incoming connection");
                        handle.close();
                        self.emit(UiEvent::SessionNotice(format!(
                            "refused connection from {}",
                            remote
                        )));
                    }
                }
            }
            ChannelEvent::Data(_) => debug!("dropping data on unopened incoming channel"),
            ChannelEvent::Close | ChannelEvent::Error(_) => {
                if let Some(pending) = self.pending.take() {
                    self.emit(UiEvent::SessionNotice(format!(
                        "incoming connection from {} failed",
                        pending.remote_id()
                    )));
                }
            }
        }
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Incoming(channel) => {
                let remote = channel.remote_id().to_string();
                let busy = matches!(
                    self.connection.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                ) || self.pending.is_some();

                if busy {
                    info!(remote_id = %remote, "refusing incoming connection while busy");
                    channel.handle.close();
                    self.emit(UiEvent::SessionNotice(format!(
                        "refused connection from {}",
                        remote
                    )));
                } else {
                    info!(remote_id = %remote, "incoming connection");
                    self.pending = Some(channel);
                    self.emit(UiEvent::SessionNotice(format!(
                        "incoming connection from {}",
                        remote
                    )));
                }
            }
            SessionEvent::Disconnected => {
                warn!("peer session disconnected, reconnecting");
                let notice = match self.peer.reconnect() {
                    Ok(()) => "session disconnected, reconnecting".to_string(),
                    Err(e) => format!("session disconnected, reconnect failed: {}", e),
                };
                self.emit(UiEvent::SessionNotice(notice));
            }
            SessionEvent::Error(message) => {
                if self.connection.state() == ConnectionState::Connecting {
                    self.fail(message);
                } else {
                    warn!(error = %message, "peer session error");
                    self.emit(UiEvent::SessionNotice(message));
                }
            }
        }
    }

    /// Move to `Error` after a channel failure
    fn fail(&mut self, message: String) {
        if self.transition(LifecycleEvent::ChannelError) {
            warn!(error = %message, "connection failed");
            self.teardown();
            self.status(ConnectionState::Error, message);
        }
    }

    fn transition(&mut self, event: LifecycleEvent) -> bool {
        match self.connection.apply(event) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "ignoring stale channel event");
                false
            }
        }
    }

    /// Release everything tied to the connection that just ended
    fn teardown(&mut self) {
        self.channel_events = None;
        if let Some(diagnostic) = self.incoming.discard() {
            self.emit(UiEvent::Diagnostic(diagnostic));
        }
        self.media.teardown();
    }

    fn status(&self, state: ConnectionState, message: String) {
        self.emit(UiEvent::Status { state, message });
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }
}

async fn recv_or_wait<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_pending(pending: &mut Option<Channel>) -> Option<ChannelEvent> {
    match pending {
        Some(channel) => channel.events.recv().await,
        None => std::future::pending().await,
    }
}

/// A file send that runs beside the session loop, reporting progress as UI events
pub struct FileUpload {
    sender: FileSender,
    ui: mpsc::UnboundedSender<UiEvent>,
    _slot: UploadSlot,
}

/// Clears the session's upload flag when dropped
struct UploadSlot(Arc<AtomicBool>);

impl Drop for UploadSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FileUpload {
    pub async fn run<R: AsyncRead + Unpin>(mut self, header: FileHeader, reader: R) -> Result<SendReport> {
        let ui = self.ui.clone();
        let mut last = None;
        self.sender
            .send(header, reader, |progress| {
                if last != Some(progress.percent) {
                    last = Some(progress.percent);
                    let _ = ui.send(UiEvent::SendProgress(progress.percent));
                }
            })
            .await
            .inspect_err(|e| warn!(error = %e, "file send failed"))
    }
}
