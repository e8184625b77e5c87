//! # Connection Protocol
//!
//! Per-connection Engine.IO / Socket.IO state machine, free of any actor or
//! socket so it can be driven directly from tests. Both transports feed the
//! same machine, and a polling session keeps it when it upgrades.
//!
//! ## States:
//! - **Open**: Engine.IO session established, namespace not joined
//! - **Connected**: the client joined the served namespace
//!
//! Inbound frames go in through [`Connection::on_text`] and
//! [`Connection::on_binary`]; what the session has to do comes back as a list
//! of [`Action`]s.

use crate::channel::message::{self, ERROR_EVENT, REQUEST_EVENT, RESPONSE_EVENT};
use crate::channel::packet::{event_frames, EnginePacket, Frame, SocketPacket, SocketPacketType};
use crate::config::ChannelConfig;
use crate::conversion::{ConversionRequest, ConversionResponse};
use crate::error::{AppError, AppResult};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Most binary attachments one event may announce. `request_message` carries
/// exactly one.
pub const MAX_ATTACHMENTS: usize = 1;

/// What the session must do after feeding a frame in.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write this frame to the socket
    Send(Frame),
    /// Run this conversion and report back
    Convert(ConversionRequest),
    /// The client answered a ping
    Heartbeat,
    /// Close the websocket
    Close,
}

/// A binary event waiting for its attachments.
#[derive(Debug)]
struct PendingEvent {
    packet: SocketPacket,
    attachments: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct Connection {
    engine_sid: String,
    socket_sid: Option<String>,
    config: ChannelConfig,
    pending: Option<PendingEvent>,
}

impl Connection {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            engine_sid: Uuid::new_v4().simple().to_string(),
            socket_sid: None,
            config,
            pending: None,
        }
    }

    pub fn engine_sid(&self) -> &str {
        &self.engine_sid
    }

    pub fn is_connected(&self) -> bool {
        self.socket_sid.is_some()
    }

    /// The Engine.IO OPEN packet, first thing a new transport sends.
    pub fn open_frame(&self, upgrades: &[&str]) -> Frame {
        let handshake = json!({
            "sid": self.engine_sid,
            "upgrades": upgrades,
            "pingInterval": self.config.ping_interval_ms,
            "pingTimeout": self.config.ping_timeout_ms,
            "maxPayload": self.config.max_payload,
        });
        Frame::Text(EnginePacket::Open(handshake.to_string()).encode())
    }

    pub fn ping_frame() -> Frame {
        Frame::Text(EnginePacket::Ping(String::new()).encode())
    }

    pub fn on_text(&mut self, text: &str) -> Vec<Action> {
        let packet = match EnginePacket::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(sid = %self.engine_sid, error = %e, "Dropping undecodable frame");
                return Vec::new();
            }
        };

        match packet {
            EnginePacket::Ping(body) => {
                vec![Action::Send(Frame::Text(EnginePacket::Pong(body).encode()))]
            }
            EnginePacket::Pong(_) => vec![Action::Heartbeat],
            EnginePacket::Close => {
                self.leave_namespace("transport close");
                vec![Action::Close]
            }
            EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                Ok(packet) => self.on_packet(packet),
                Err(e) => {
                    warn!(
                        sid = %self.engine_sid,
                        error = %e,
                        "Dropping undecodable Socket.IO packet"
                    );
                    Vec::new()
                }
            },
            EnginePacket::Open(_) | EnginePacket::Upgrade | EnginePacket::Noop => Vec::new(),
        }
    }

    pub fn on_binary(&mut self, data: Vec<u8>) -> Vec<Action> {
        let Some(pending) = self.pending.as_mut() else {
            warn!(
                sid = %self.engine_sid,
                bytes = data.len(),
                "Binary frame without a pending event"
            );
            return Vec::new();
        };

        pending.attachments.push(data);
        if pending.attachments.len() < pending.packet.attachments {
            return Vec::new();
        }

        match self.pending.take() {
            Some(PendingEvent { packet, attachments }) => self.on_event(packet, attachments),
            None => Vec::new(),
        }
    }

    /// Frames carrying a successful conversion.
    pub fn response_frames(&self, response: ConversionResponse) -> Vec<Frame> {
        let (args, attachments) = message::response_args(response);
        event_frames(&self.config.namespace, RESPONSE_EVENT, args, attachments)
    }

    /// Frames carrying a failed conversion.
    pub fn error_frames(&self, timestamp: Option<i64>, error: &AppError) -> Vec<Frame> {
        event_frames(
            &self.config.namespace,
            ERROR_EVENT,
            message::error_args(timestamp, error),
            Vec::new(),
        )
    }

    /// Forget the namespace session, logging the transition once.
    pub fn leave_namespace(&mut self, reason: &str) {
        self.pending = None;
        if let Some(sid) = self.socket_sid.take() {
            debug!(sid = %sid, reason = reason, "Client disconnected");
        }
    }

    fn on_packet(&mut self, packet: SocketPacket) -> Vec<Action> {
        match packet.kind {
            SocketPacketType::Connect => self.on_connect(&packet.namespace),
            SocketPacketType::Disconnect if packet.namespace == self.config.namespace => {
                self.leave_namespace("client disconnect");
                Vec::new()
            }
            SocketPacketType::Event => self.on_event(packet, Vec::new()),
            SocketPacketType::BinaryEvent if packet.attachments == 0 => {
                self.on_event(packet, Vec::new())
            }
            SocketPacketType::BinaryEvent => self.on_binary_event(packet),
            _ => {
                debug!(
                    sid = %self.engine_sid,
                    kind = ?packet.kind,
                    namespace = %packet.namespace,
                    "Ignoring packet"
                );
                Vec::new()
            }
        }
    }

    /// Park a binary event until its attachments arrive. The count comes from
    /// the client, so nothing is buffered outside the joined namespace or past
    /// [`MAX_ATTACHMENTS`].
    fn on_binary_event(&mut self, packet: SocketPacket) -> Vec<Action> {
        if packet.namespace != self.config.namespace || !self.is_connected() {
            debug!(
                sid = %self.engine_sid,
                namespace = %packet.namespace,
                "Binary event outside a joined namespace"
            );
            return Vec::new();
        }
        if packet.attachments > MAX_ATTACHMENTS {
            let err = AppError::Protocol(format!(
                "{} attachments announced, at most {} allowed",
                packet.attachments, MAX_ATTACHMENTS
            ));
            warn!(sid = %self.engine_sid, error = %err, "Dropping binary event");
            return Vec::new();
        }

        if self.pending.is_some() {
            warn!(sid = %self.engine_sid, "Binary event replaced before its attachments arrived");
        }
        self.pending = Some(PendingEvent {
            packet,
            attachments: Vec::new(),
        });
        Vec::new()
    }

    fn on_connect(&mut self, namespace: &str) -> Vec<Action> {
        if namespace != self.config.namespace {
            warn!(sid = %self.engine_sid, namespace = namespace, "Rejecting unknown namespace");
            let reply = SocketPacket::new(
                SocketPacketType::ConnectError,
                namespace,
                Some(json!({ "message": "Invalid namespace" })),
            );
            return vec![Action::Send(reply.into_frame())];
        }

        let sid = Uuid::new_v4().simple().to_string();
        info!(
            sid = %sid,
            engine_sid = %self.engine_sid,
            timestamp = %chrono::Local::now().to_rfc3339(),
            "Client connected"
        );

        let reply = SocketPacket::new(
            SocketPacketType::Connect,
            namespace,
            Some(json!({ "sid": sid })),
        );
        self.socket_sid = Some(sid);
        vec![Action::Send(reply.into_frame())]
    }

    fn on_event(&mut self, packet: SocketPacket, attachments: Vec<Vec<u8>>) -> Vec<Action> {
        if packet.namespace != self.config.namespace || !self.is_connected() {
            debug!(
                sid = %self.engine_sid,
                namespace = %packet.namespace,
                "Event outside a joined namespace"
            );
            return Vec::new();
        }

        let (name, args) = match split_event(packet.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(sid = %self.engine_sid, error = %e, "Malformed event");
                return Vec::new();
            }
        };

        if name != REQUEST_EVENT {
            debug!(sid = %self.engine_sid, event = %name, "Ignoring unknown event");
            return Vec::new();
        }

        match message::parse_request(&args, &attachments) {
            Ok(request) => vec![Action::Convert(request)],
            Err(e) => {
                warn!(sid = %self.engine_sid, error = %e, "Rejecting conversion request");
                self.error_frames(message::peek_timestamp(&args), &e)
                    .into_iter()
                    .map(Action::Send)
                    .collect()
            }
        }
    }
}

/// `["name", args...]` into its name and arguments.
fn split_event(data: Option<Value>) -> AppResult<(String, Vec<Value>)> {
    let Some(Value::Array(mut items)) = data else {
        return Err(AppError::Protocol("event data must be an array".to_string()));
    };
    if items.is_empty() {
        return Err(AppError::Protocol("event without a name".to_string()));
    }
    match items.remove(0) {
        Value::String(name) => Ok((name, items)),
        other => Err(AppError::Protocol(format!("event name must be a string, got {}", other))),
    }
}
