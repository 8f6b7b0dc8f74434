use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::channel::ChannelHandle;
use crate::config::TransferConfig;
use crate::lifecycle::ConnectionState;
use crate::protocol::{encode_chunk, encode_control, ControlMessage, FileHeader};
use crate::{Error, Result};

/// Progress of the file currently being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingTransferProgress {
    pub file_size: u64,
    pub bytes_sent: u64,
    pub percent: u8,
}

/// Summary of a finished send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_sent: u64,
    pub chunks: u64,
    /// Number of times the sender waited for the outgoing buffer to drain
    pub pauses: u64,
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

/// Protocol anomalies. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A chunk arrived with no file header before it
    OrphanChunk { bytes: usize },

    /// A file-end arrived with no file header before it
    OrphanEnd,

    /// The bytes received did not add up to the announced size
    SizeMismatch {
        name: String,
        expected: u64,
        received: u64,
    },

    /// A new file header replaced an incomplete transfer
    TransferSuperseded { name: String, received: u64 },

    /// The connection went away mid-transfer
    TransferDiscarded { name: String, received: u64 },

    /// A payload of unrecognized shape was dropped
    UnknownPayload(String),
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::OrphanChunk { bytes } => {
                write!(f, "dropped {} byte chunk with no file header", bytes)
            }
            Diagnostic::OrphanEnd => write!(f, "ignored file end with no file header"),
            Diagnostic::SizeMismatch {
                name,
                expected,
                received,
            } => write!(
                f,
                "{}: expected {} bytes, received {}",
                name, expected, received
            ),
            Diagnostic::TransferSuperseded { name, received } => write!(
                f,
                "{}: replaced by a new transfer after {} bytes",
                name, received
            ),
            Diagnostic::TransferDiscarded { name, received } => write!(
                f,
                "{}: discarded after {} bytes, connection lost",
                name, received
            ),
            Diagnostic::UnknownPayload(shape) => write!(f, "dropped unknown payload: {}", shape),
        }
    }
}

/// Percentage of `done` over `total`, rounded and capped at 100
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.min(100.0) as u8
}

/// Sends one file at a time over a connected channel
pub struct FileSender {
    channel: Arc<dyn ChannelHandle>,
    state: watch::Receiver<ConnectionState>,
    config: TransferConfig,
}

impl FileSender {
    pub fn new(
        channel: Arc<dyn ChannelHandle>,
        state: watch::Receiver<ConnectionState>,
        config: TransferConfig,
    ) -> Self {
        Self {
            channel,
            state,
            config,
        }
    }

    /// Send `header` followed by the contents of `reader` in fixed-size chunks,
    /// then a file-end.
    ///
    /// Stops at the next chunk boundary or drain wait once the connection it
    /// started on leaves `Connected`, even if a new connection has since come
    /// up. A source that yields a different byte count than
    /// `header.size` still gets its file-end, then fails.
    pub async fn send<R, F>(
        &mut self,
        header: FileHeader,
        mut reader: R,
        mut on_progress: F,
    ) -> Result<SendReport>
    where
        R: AsyncRead + Unpin,
        F: FnMut(OutgoingTransferProgress),
    {
        self.config.validate()?;
        self.ensure_connected()?;

        let file_size = header.size;
        let name = header.name.clone();
        self.channel
            .send(encode_control(&ControlMessage::FileHeader(header))?)?;
        debug!(name = %name, size = file_size, "sent file header");

        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut report = SendReport {
            bytes_sent: 0,
            chunks: 0,
            pauses: 0,
        };

        loop {
            let bytes_read = read_chunk(&mut reader, &mut buffer).await?;
            if bytes_read == 0 {
                break;
            }

            if self.wait_for_drain().await? {
                report.pauses += 1;
            }
            self.ensure_connected()?;

            self.channel
                .send(encode_chunk(Bytes::copy_from_slice(&buffer[..bytes_read])))?;

            report.bytes_sent += bytes_read as u64;
            report.chunks += 1;
            on_progress(OutgoingTransferProgress {
                file_size,
                bytes_sent: report.bytes_sent,
                percent: percent(report.bytes_sent, file_size),
            });

            // Let inbound traffic and chat get a turn between chunks
            tokio::task::yield_now().await;
        }

        self.ensure_connected()?;
        self.channel.send(encode_control(&ControlMessage::FileEnd)?)?;

        if report.bytes_sent != file_size {
            return Err(Error::TransferFailed(format!(
                "{} announced {} bytes but {} were read",
                name, file_size, report.bytes_sent
            )));
        }

        info!(
            name = %name,
            bytes = report.bytes_sent,
            chunks = report.chunks,
            pauses = report.pauses,
            "file sent"
        );
        Ok(report)
    }

    /// Wait until the outgoing buffer is at or below the high water mark.
    ///
    /// Returns whether the sender had to pause. Fails with `Cancelled` on the
    /// first connection state change. Gives up waiting after the drain
    /// timeout and lets the caller proceed.
    pub async fn wait_for_drain(&mut self) -> Result<bool> {
        let high_water = self.config.high_water_mark();
        let buffered = self.channel.buffered_amount();
        if buffered <= high_water {
            return Ok(false);
        }

        debug!(buffered, high_water, "applying backpressure");
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let changed = tokio::select! {
                _ = sleep(self.config.drain_poll) => false,
                _ = self.state.changed() => true,
            };
            if changed {
                debug!(state = %*self.state.borrow(), "connection changed during drain wait");
                return Err(Error::Cancelled);
            }
            self.ensure_connected()?;

            if self.channel.buffered_amount() <= high_water {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    buffered = self.channel.buffered_amount(),
                    high_water, "buffer drain timeout, proceeding anyway"
                );
                return Ok(true);
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match *self.state.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                return Err(Error::NotConnected);
            }
            ConnectionState::Error | ConnectionState::Closed => return Err(Error::Cancelled),
        }
        // Connected never transitions to itself, so any change means the
        // connection this sender was handed is gone
        if self.state.has_changed().unwrap_or(true) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Fill `buffer` from `reader`, short only at end of input
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Something the receiver wants surfaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    Progress(u8),
    FileReady(ReceivedFile),
    Diagnostic(Diagnostic),
}

/// Accumulates the one active incoming transfer
#[derive(Debug, Default)]
pub struct IncomingTransfer {
    meta: Option<FileHeader>,
    chunks: Vec<Bytes>,
    received_bytes: u64,
}

impl IncomingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.meta.is_some()
    }

    pub fn meta(&self) -> Option<&FileHeader> {
        self.meta.as_ref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Start a transfer. An incomplete one in progress is thrown away.
    pub fn on_header(&mut self, header: FileHeader) -> Vec<ReceiveEvent> {
        let mut events = Vec::new();
        if let Some(prior) = self.meta.take() {
            let diagnostic = Diagnostic::TransferSuperseded {
                name: prior.name,
                received: self.received_bytes,
            };
            warn!(%diagnostic, "incoming transfer superseded");
            events.push(ReceiveEvent::Diagnostic(diagnostic));
        }

        info!(name = %header.name, size = header.size, mime = %header.mime, "receiving file");
        self.chunks.clear();
        self.received_bytes = 0;
        self.meta = Some(header);
        events
    }

    pub fn on_chunk(&mut self, data: Bytes) -> Vec<ReceiveEvent> {
        let Some(meta) = &self.meta else {
            let diagnostic = Diagnostic::OrphanChunk { bytes: data.len() };
            warn!(%diagnostic, "protocol anomaly");
            return vec![ReceiveEvent::Diagnostic(diagnostic)];
        };

        self.received_bytes += data.len() as u64;
        self.chunks.push(data);

        if meta.size > 0 {
            vec![ReceiveEvent::Progress(percent(self.received_bytes, meta.size))]
        } else {
            Vec::new()
        }
    }

    /// Assemble and hand out whatever arrived, then reset
    pub fn on_end(&mut self) -> Vec<ReceiveEvent> {
        let Some(meta) = self.meta.take() else {
            warn!(diagnostic = %Diagnostic::OrphanEnd, "protocol anomaly");
            return vec![ReceiveEvent::Diagnostic(Diagnostic::OrphanEnd)];
        };

        let mut events = Vec::new();
        let received = self.received_bytes;
        if received != meta.size {
            let diagnostic = Diagnostic::SizeMismatch {
                name: meta.name.clone(),
                expected: meta.size,
                received,
            };
            warn!(%diagnostic, "protocol anomaly");
            events.push(ReceiveEvent::Diagnostic(diagnostic));
        }

        let mut data = BytesMut::with_capacity(received as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        self.received_bytes = 0;

        info!(name = %meta.name, bytes = data.len(), "file received");
        events.push(ReceiveEvent::FileReady(ReceivedFile {
            name: meta.name,
            mime: meta.mime,
            data: data.freeze(),
        }));
        events
    }

    /// Drop any partial transfer, e.g. when the connection goes away
    pub fn discard(&mut self) -> Option<Diagnostic> {
        let meta = self.meta.take()?;
        let diagnostic = Diagnostic::TransferDiscarded {
            name: meta.name,
            received: self.received_bytes,
        };
        self.chunks.clear();
        self.received_bytes = 0;
        warn!(%diagnostic, "incoming transfer discarded");
        Some(diagnostic)
    }
}
