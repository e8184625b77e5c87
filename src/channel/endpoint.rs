//! # Channel Endpoint
//!
//! `/socket.io/` routing. Every request is checked against the Engine.IO v4
//! handshake rules first, then handed to the transport it names.
//!
//! | Request | Goes to |
//! |---|---|
//! | `GET ?transport=polling` | new polling session |
//! | `GET ?transport=polling&sid=..` | long poll |
//! | `POST ?transport=polling&sid=..` | [`polling::post_endpoint`] |
//! | `GET ?transport=websocket` | new websocket session |
//! | `GET ?transport=websocket&sid=..` | upgrade of a polling session |

use crate::channel::polling;
use crate::channel::session::ChannelSession;
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Engine.IO protocol revision spoken here.
const ENGINE_IO_VERSION: &str = "4";

/// Query string of every Engine.IO request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "EIO")]
    pub eio: Option<String>,
    pub transport: Option<String>,
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Polling,
    Websocket,
}

/// Handshake refusals, rendered the way Engine.IO clients expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    UnknownTransport,
    UnknownSid,
    BadHandshakeMethod,
    BadRequest,
    UnsupportedProtocolVersion,
}

impl HandshakeError {
    pub fn code(self) -> u8 {
        match self {
            HandshakeError::UnknownTransport => 0,
            HandshakeError::UnknownSid => 1,
            HandshakeError::BadHandshakeMethod => 2,
            HandshakeError::BadRequest => 3,
            HandshakeError::UnsupportedProtocolVersion => 5,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            HandshakeError::UnknownTransport => "Transport unknown",
            HandshakeError::UnknownSid => "Session ID unknown",
            HandshakeError::BadHandshakeMethod => "Bad handshake method",
            HandshakeError::BadRequest => "Bad request",
            HandshakeError::UnsupportedProtocolVersion => "Unsupported protocol version",
        }
    }

    pub fn to_response(self) -> HttpResponse {
        HttpResponse::BadRequest().json(json!({
            "code": self.code(),
            "message": self.message(),
        }))
    }
}

/// Engine.IO v4 over polling or websocket.
pub fn check_handshake(query: &HandshakeQuery) -> Result<Transport, HandshakeError> {
    let transport = match query.transport.as_deref() {
        Some("polling") => Transport::Polling,
        Some("websocket") => Transport::Websocket,
        _ => return Err(HandshakeError::UnknownTransport),
    };
    if query.eio.as_deref() != Some(ENGINE_IO_VERSION) {
        return Err(HandshakeError::UnsupportedProtocolVersion);
    }
    Ok(transport)
}

/// Register `/socket.io` and `/socket.io/` for both transports.
pub fn configure(cfg: &mut web::ServiceConfig, max_payload: usize) {
    for path in ["/socket.io", "/socket.io/"] {
        cfg.service(
            web::resource(path)
                .app_data(web::PayloadConfig::new(max_payload))
                .route(web::get().to(channel_endpoint))
                .route(web::post().to(polling::post_endpoint)),
        );
    }
}

/// `GET /socket.io/`: polling handshake, long poll or websocket upgrade.
pub async fn channel_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<HandshakeQuery>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let transport = match check_handshake(&query) {
        Ok(transport) => transport,
        Err(refusal) => {
            debug!(
                peer = ?req.connection_info().peer_addr(),
                eio = ?query.eio,
                transport = ?query.transport,
                reason = refusal.message(),
                "Refusing channel handshake"
            );
            return Ok(refusal.to_response());
        }
    };

    let session = match (transport, query.sid.as_deref()) {
        (Transport::Polling, None) => return Ok(polling::handshake(&state)),
        (Transport::Polling, Some(sid)) => return Ok(polling::poll(&state, sid).await),
        (Transport::Websocket, None) => ChannelSession::new(state.get_ref().clone()),
        (Transport::Websocket, Some(sid)) => {
            if !state.polling.contains(sid) {
                return Ok(HandshakeError::UnknownSid.to_response());
            }
            ChannelSession::upgrading(state.get_ref().clone(), sid.to_string())
        }
    };

    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(state.config.channel.max_payload)
        .start()
}
