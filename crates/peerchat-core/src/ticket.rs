use iroh::{EndpointAddr, PublicKey};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The identifier peers exchange out of band to reach each other
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// The peer's endpoint address
    pub addr: EndpointAddr,
}

impl Ticket {
    pub fn new(addr: EndpointAddr) -> Self {
        Self { addr }
    }

    /// The endpoint this ticket points at
    pub fn id(&self) -> PublicKey {
        self.addr.id
    }

    /// Serialize to a human-friendly string
    pub fn serialize(&self) -> String {
        let bytes = postcard::to_allocvec(self).expect("ticket serialization cannot fail");
        data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
    }

    /// Parse from a human-friendly string. Case and surrounding whitespace are ignored.
    pub fn deserialize(s: &str) -> Result<Self> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Err(Error::InvalidTicket("empty ticket".into()));
        }

        let bytes = data_encoding::BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|e| Error::InvalidTicket(format!("invalid base32: {}", e)))?;

        postcard::from_bytes(&bytes)
            .map_err(|e| Error::InvalidTicket(format!("invalid ticket data: {}", e)))
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}

impl std::str::FromStr for Ticket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::deserialize(s)
    }
}
