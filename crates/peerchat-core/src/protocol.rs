use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Payload;
use crate::Result;

/// Discriminators that mark a JSON string as a control message
const CONTROL_TYPES: &[&str] = &["file-header", "file-end"];

/// Field carried by legacy structured chat payloads
const LEGACY_MESSAGE_FIELD: &str = "message";

/// Control messages framing a file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Announces a file; precedes its chunks
    FileHeader(FileHeader),

    /// Follows the last chunk of a file
    FileEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Original filename
    pub name: String,

    /// Total size in bytes
    pub size: u64,

    /// MIME type of the content
    pub mime: String,
}

impl FileHeader {
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime: mime.into(),
        }
    }
}

/// What an inbound payload turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ChatText(String),
    Control(ControlMessage),
    BinaryChunk(Bytes),
    /// Nothing we recognize; carries a short description of the shape
    UnknownFormat(String),
}

/// Classify one inbound payload. First match wins:
///
/// 1. strings carrying JSON with a known `type` are control messages,
///    every other string is chat text, verbatim
/// 2. binary payloads are file chunks
/// 3. structured values with a string `message` field are chat text
/// 4. anything else is an unknown format
pub fn classify(payload: Payload) -> Inbound {
    match payload {
        Payload::Text(text) => match parse_control(&text) {
            Some(control) => Inbound::Control(control),
            None => Inbound::ChatText(text),
        },
        Payload::Binary(data) => Inbound::BinaryChunk(data),
        Payload::Structured(value) => match value.get(LEGACY_MESSAGE_FIELD) {
            Some(Value::String(message)) => Inbound::ChatText(message.clone()),
            _ => Inbound::UnknownFormat(describe(&value)),
        },
    }
}

fn parse_control(text: &str) -> Option<ControlMessage> {
    // Cheap reject for ordinary chat before invoking the JSON parser
    if !text.trim_start().starts_with('{') {
        return None;
    }

    let value: Value = serde_json::from_str(text).ok()?;
    let kind = value.get("type")?.as_str()?;
    if !CONTROL_TYPES.contains(&kind) {
        return None;
    }

    serde_json::from_value(value).ok()
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(_) => "number".into(),
        Value::String(_) => "string".into(),
        Value::Array(items) => format!("array of {}", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
    }
}

/// Chat text goes out as-is
pub fn encode_chat(text: &str) -> Payload {
    Payload::Text(text.to_string())
}

/// Control messages go out as JSON strings
pub fn encode_control(msg: &ControlMessage) -> Result<Payload> {
    Ok(Payload::Text(serde_json::to_string(msg)?))
}

/// Chunks go out as raw bytes with no framing
pub fn encode_chunk(data: Bytes) -> Payload {
    Payload::Binary(data)
}
