//! Peer-to-peer wire protocol for distnode.
//!
//! This module defines the messages exchanged between distnode daemons
//! over TCP connections.
//!
//! # Wire Format
//!
//! Each message is transmitted as a **length-prefixed frame**:
//!
//! ```text
//! +-------------------+------------------------------+
//! | Length (4 bytes)   | JSON Payload                  |
//! | big-endian u32     | (variable length)             |
//! +-------------------+------------------------------+
//! ```
//!
//! The length prefix tells the receiver how many bytes to read for the
//! payload. This avoids the need for delimiters, which would require
//! escaping inside the payload.
//!
//! # Why JSON?
//!
//! Readability across implementations matters more here than wire size: the
//! cluster is small, traffic is low-rate sensor telemetry, and a human
//! should be able to `nc` a node and read what comes back.
//!
//! # Envelope
//!
//! Every message on the wire is an [`Envelope`] carrying a [`MessageKind`], a
//! sender id, a millisecond timestamp, and an opaque JSON payload. Handlers
//! downstream of decoding are responsible for interpreting `payload`
//! according to `kind`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default maximum frame size: 1 MiB. Any frame larger than this is
/// rejected to prevent memory exhaustion from malformed or malicious data.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_048_576;

/// Errors that can occur during protocol encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode error: {0}")]
    Encode(serde_json::Error),

    #[error("JSON decode error: {0}")]
    Decode(serde_json::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// The closed set of message kinds distnode understands on the wire.
///
/// `JoinRequest`, `PeerList`, and `SensorUpdate` are load-bearing. The
/// remaining variants are reserved: a conforming node accepts and decodes
/// them but the dispatcher either no-ops (`Ping`/`Pong`) or never emits them
/// today (`GossipState`, `FullSyncRequest`, `FullSyncResponse`, `Error`,
/// `Ack`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "JOIN_REQUEST")]
    JoinRequest,
    #[serde(rename = "PEER_LIST")]
    PeerList,
    #[serde(rename = "SENSOR_UPDATE")]
    SensorUpdate,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "GOSSIP_STATE")]
    GossipState,
    #[serde(rename = "FULL_SYNC_REQUEST")]
    FullSyncRequest,
    #[serde(rename = "FULL_SYNC_RESPONSE")]
    FullSyncResponse,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "ACK")]
    Ack,
}

impl MessageKind {
    /// The literal wire string for this kind, e.g. `"JOIN_REQUEST"`.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MessageKind::JoinRequest => "JOIN_REQUEST",
            MessageKind::PeerList => "PEER_LIST",
            MessageKind::SensorUpdate => "SENSOR_UPDATE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::GossipState => "GOSSIP_STATE",
            MessageKind::FullSyncRequest => "FULL_SYNC_REQUEST",
            MessageKind::FullSyncResponse => "FULL_SYNC_RESPONSE",
            MessageKind::Error => "ERROR",
            MessageKind::Ack => "ACK",
        }
    }
}

/// The envelope wrapping every message exchanged between nodes.
///
/// `payload` is left as an untyped [`serde_json::Value`] because its shape
/// depends on `kind`; the dispatcher's handlers are responsible for
/// deserializing it into something concrete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: String,
    pub timestamp: i64,
    #[serde(default = "default_payload")]
    pub payload: Value,
}

fn default_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    /// Builds an envelope stamped with the current wall-clock time in
    /// milliseconds.
    pub fn new(kind: MessageKind, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            sender_id: sender_id.into(),
            timestamp: now_ms(),
            payload,
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Encodes an [`Envelope`] into a length-prefixed byte buffer.
///
/// The returned buffer contains a 4-byte big-endian length prefix followed
/// by the JSON-encoded envelope. This is the format written to TCP streams.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;

    let length = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decodes an [`Envelope`] from a JSON payload (without the length prefix).
///
/// Validates that the payload is a JSON object carrying a known `type` and a
/// non-empty `sender_id`; callers that only have raw bytes off the wire
/// should prefer [`read_message`], which handles framing as well.
pub fn decode(payload: &[u8]) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::Decode)?;
    if !value.is_object() {
        return Err(ProtocolError::MalformedEnvelope(
            "envelope must be a JSON object".to_string(),
        ));
    }

    let envelope: Envelope = serde_json::from_value(value).map_err(ProtocolError::Decode)?;
    if envelope.sender_id.is_empty() {
        return Err(ProtocolError::MalformedEnvelope(
            "sender_id must not be empty".to_string(),
        ));
    }

    Ok(envelope)
}

/// Writes an [`Envelope`] to an async writer (e.g. a TCP stream half),
/// rejecting it up front if it would exceed `max_frame_size`.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame_size: u32,
) -> Result<(), ProtocolError> {
    let frame = encode(envelope)?;
    let payload_len = (frame.len() - 4) as u32;
    if payload_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads an [`Envelope`] from an async reader (e.g. a TCP stream half).
///
/// Returns `ProtocolError::ConnectionClosed` if the peer closes the
/// connection cleanly while we are waiting for the next length prefix.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Envelope, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let length = u32::from_be_bytes(len_buf);

    if length > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    decode(&payload)
}
