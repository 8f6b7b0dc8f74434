pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod memory;
pub mod node;
pub mod protocol;
pub mod session;
pub mod ticket;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ChannelEvent, ChannelHandle, Payload, PeerSession, SessionEvent};
pub use config::TransferConfig;
pub use error::{Error, Result};
pub use lifecycle::ConnectionState;
pub use memory::{MemoryNetwork, MemoryPeer};
pub use node::IrohPeer;
pub use protocol::{ControlMessage, FileHeader};
pub use session::{ChatOrigin, ChatSession, FileUpload, UiEvent};
pub use ticket::Ticket;
pub use transfer::{Diagnostic, ReceivedFile, SendReport};
