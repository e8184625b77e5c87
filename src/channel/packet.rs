//! # Engine.IO / Socket.IO Packet Codec
//!
//! The event channel speaks Socket.IO (protocol 5) on top of Engine.IO
//! (protocol 4), over websocket or HTTP long-polling.
//!
//! ## Engine.IO (one websocket text frame = one packet):
//! - `0{json}` open, `1` close, `2` ping, `3` pong, `4<data>` message,
//!   `5` upgrade, `6` noop
//! - websocket binary frames carry raw binary message payloads
//! - a long-polling body joins packets with `\x1e`; binary ones are sent as
//!   `b<base64>`
//!
//! ## Socket.IO (inside an Engine.IO message):
//! ```text
//! <type>[<attachments>-][<namespace>,][<ack id>][<json>]
//! ```
//! Binary events (type 5) replace every byte buffer with
//! `{"_placeholder":true,"num":<n>}` and send the buffers as the next
//! `<attachments>` binary frames, in order.

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

/// Separates packets inside one long-polling body.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// One websocket frame, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Engine.IO packet carried in a text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> AppResult<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| AppError::Protocol("empty Engine.IO packet".to_string()))?;
        let body = chars.as_str().to_string();

        match kind {
            '0' => Ok(EnginePacket::Open(body)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body)),
            '3' => Ok(EnginePacket::Pong(body)),
            '4' => Ok(EnginePacket::Message(body)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(AppError::Protocol(format!(
                "unknown Engine.IO packet type '{}'",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(body) => format!("0{}", body),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(body) => format!("2{}", body),
            EnginePacket::Pong(body) => format!("3{}", body),
            EnginePacket::Message(body) => format!("4{}", body),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// Socket.IO packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl SocketPacketType {
    fn from_char(c: char) -> AppResult<Self> {
        match c {
            '0' => Ok(SocketPacketType::Connect),
            '1' => Ok(SocketPacketType::Disconnect),
            '2' => Ok(SocketPacketType::Event),
            '3' => Ok(SocketPacketType::Ack),
            '4' => Ok(SocketPacketType::ConnectError),
            '5' => Ok(SocketPacketType::BinaryEvent),
            '6' => Ok(SocketPacketType::BinaryAck),
            other => Err(AppError::Protocol(format!(
                "unknown Socket.IO packet type '{}'",
                other
            ))),
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, SocketPacketType::BinaryEvent | SocketPacketType::BinaryAck)
    }
}

/// A decoded Socket.IO packet, attachments not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: SocketPacketType,
    pub namespace: String,
    pub attachments: usize,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    pub fn new(kind: SocketPacketType, namespace: &str, data: Option<Value>) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            attachments: 0,
            ack_id: None,
            data,
        }
    }

    pub fn decode(text: &str) -> AppResult<Self> {
        let first = text
            .chars()
            .next()
            .ok_or_else(|| AppError::Protocol("empty Socket.IO packet".to_string()))?;
        let kind = SocketPacketType::from_char(first)?;
        let mut rest = &text[first.len_utf8()..];

        let mut attachments = 0;
        if kind.is_binary() {
            let dash = rest.find('-').ok_or_else(|| {
                AppError::Protocol("binary packet without attachment count".to_string())
            })?;
            attachments = rest[..dash].parse::<usize>().map_err(|_| {
                AppError::Protocol(format!("bad attachment count '{}'", &rest[..dash]))
            })?;
            rest = &rest[dash + 1..];
        }

        let mut namespace = "/".to_string();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    namespace = rest[..comma].to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|_| AppError::Protocol(format!("bad ack id '{}'", &rest[..digits])))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            namespace,
            attachments,
            ack_id,
            data,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(char::from(b'0' + self.kind as u8));
        if self.kind.is_binary() {
            out.push_str(&self.attachments.to_string());
            out.push('-');
        }
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Wrap in an Engine.IO message text frame.
    pub fn into_frame(self) -> Frame {
        Frame::Text(EnginePacket::Message(self.encode()).encode())
    }
}

/// Placeholder standing in for attachment `num`.
pub fn placeholder(num: usize) -> Value {
    json!({ "_placeholder": true, "num": num })
}

/// Attachment index if `value` is a binary placeholder.
pub fn placeholder_index(value: &Value) -> Option<usize> {
    let object = value.as_object()?;
    if object.get("_placeholder")?.as_bool()? {
        object.get("num")?.as_u64().map(|n| n as usize)
    } else {
        None
    }
}

/// Frames for one event, binary when `attachments` is non-empty.
///
/// `args` must already contain the placeholders for `attachments`.
pub fn event_frames(
    namespace: &str,
    name: &str,
    args: Vec<Value>,
    attachments: Vec<Vec<u8>>,
) -> Vec<Frame> {
    let mut data = Vec::with_capacity(args.len() + 1);
    data.push(Value::String(name.to_string()));
    data.extend(args);

    let kind = if attachments.is_empty() {
        SocketPacketType::Event
    } else {
        SocketPacketType::BinaryEvent
    };
    let mut packet = SocketPacket::new(kind, namespace, Some(Value::Array(data)));
    packet.attachments = attachments.len();

    let mut frames = Vec::with_capacity(attachments.len() + 1);
    frames.push(packet.into_frame());
    frames.extend(attachments.into_iter().map(Frame::Binary));
    frames
}

/// Long-polling body for `frames`.
pub fn encode_payload(frames: &[Frame]) -> String {
    frames
        .iter()
        .map(|frame| match frame {
            Frame::Text(text) => text.clone(),
            Frame::Binary(data) => format!("b{}", STANDARD.encode(data)),
        })
        .collect::<Vec<_>>()
        .join(RECORD_SEPARATOR.to_string().as_str())
}

/// Frames of a long-polling body, in order.
pub fn decode_payload(body: &str) -> AppResult<Vec<Frame>> {
    body.split(RECORD_SEPARATOR)
        .map(|packet| match packet.strip_prefix('b') {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Frame::Binary)
                .map_err(|e| AppError::Protocol(format!("bad base64 attachment: {}", e))),
            None => Ok(Frame::Text(packet.to_string())),
        })
        .collect()
}
