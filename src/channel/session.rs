//! # Channel Session
//!
//! One actix actor per websocket connection. The actor owns a protocol
//! [`Connection`], writes the frames it asks for, keeps the Engine.IO
//! heartbeat going and hands conversions to the blocking pool.
//!
//! ## Message Flow:
//! 1. `GET /socket.io/?EIO=4&transport=websocket` is upgraded by
//!    [`channel_endpoint`](crate::channel::endpoint::channel_endpoint)
//! 2. `started` sends the Engine.IO OPEN packet and starts the ping timer;
//!    a socket taking over a polling session waits for `2probe` and `5`
//!    instead
//! 3. Inbound frames go through the protocol state machine
//! 4. A conversion runs in `web::block`; its result comes back to the actor
//!    as a [`ConversionFinished`] message and is written as `response` or
//!    `response_error`

use crate::channel::dispatch::{run_conversion, ConversionFinished};
use crate::channel::packet::{EnginePacket, Frame};
use crate::channel::protocol::{Action, Connection};
use crate::conversion::ConversionRequest;
use crate::state::AppState;
use actix::prelude::*;
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const UPGRADE_PING_BODY: &str = "probe";

pub struct ChannelSession {
    sid: String,
    /// `None` until a polling session finishes moving onto this socket
    connection: Option<Connection>,
    state: AppState,
    last_heartbeat: Instant,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl ChannelSession {
    /// A session opened directly over websocket.
    pub fn new(state: AppState) -> Self {
        let connection = Connection::new(state.config.channel.clone());
        let sid = connection.engine_sid().to_string();
        Self::with_connection(state, sid, Some(connection))
    }

    /// A websocket taking over the polling session `sid`.
    pub fn upgrading(state: AppState, sid: String) -> Self {
        Self::with_connection(state, sid, None)
    }

    fn with_connection(state: AppState, sid: String, connection: Option<Connection>) -> Self {
        let channel = &state.config.channel;
        Self {
            sid,
            connection,
            ping_interval: Duration::from_millis(channel.ping_interval_ms),
            ping_timeout: Duration::from_millis(channel.ping_timeout_ms),
            last_heartbeat: Instant::now(),
            state,
        }
    }

    fn write(ctx: &mut ws::WebsocketContext<Self>, frame: Frame) {
        match frame {
            Frame::Text(text) => ctx.text(text),
            Frame::Binary(data) => ctx.binary(data),
        }
    }

    fn apply(&mut self, actions: Vec<Action>, ctx: &mut ws::WebsocketContext<Self>) {
        for action in actions {
            match action {
                Action::Send(frame) => Self::write(ctx, frame),
                Action::Convert(request) => self.dispatch(request, ctx),
                Action::Heartbeat => self.last_heartbeat = Instant::now(),
                Action::Close => ctx.stop(),
            }
        }
    }

    /// Run one conversion off the actor and report back through the mailbox.
    fn dispatch(&mut self, request: ConversionRequest, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(
            sid = %self.sid,
            timestamp = request.timestamp,
            device_selector = request.device_selector,
            bytes = request.payload.len(),
            "Dispatching conversion"
        );

        let service = self.state.service.clone();
        let addr = ctx.address();
        actix_web::rt::spawn(async move {
            // Dropped silently if the session is gone by now
            addr.do_send(run_conversion(service, request).await);
        });
    }

    /// Frames on a socket that is still taking over a polling session.
    fn on_upgrade_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match EnginePacket::decode(text) {
            Ok(EnginePacket::Ping(body)) if body == UPGRADE_PING_BODY => {
                if self.state.polling.begin_upgrade(&self.sid) {
                    Self::write(ctx, Frame::Text(EnginePacket::Pong(body).encode()));
                } else {
                    warn!(sid = %self.sid, "Upgrade ping for a session that is gone");
                    ctx.stop();
                }
            }
            Ok(EnginePacket::Upgrade) => {
                let recipient = ctx.address().recipient();
                match self.state.polling.complete_upgrade(&self.sid, recipient) {
                    Some((connection, queued)) => {
                        info!(sid = %self.sid, "Upgraded to websocket");
                        self.connection = Some(connection);
                        self.last_heartbeat = Instant::now();
                        for frame in queued {
                            Self::write(ctx, frame);
                        }
                    }
                    None => {
                        warn!(sid = %self.sid, "Upgrade for a session that is gone");
                        ctx.stop();
                    }
                }
            }
            _ => debug!(sid = %self.sid, "Ignoring frame before upgrade"),
        }
    }
}

impl Actor for ChannelSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        match &self.connection {
            Some(connection) => {
                info!(sid = %self.sid, transport = "websocket", "Channel session opened");
                self.state.increment_active_sessions();
                Self::write(ctx, connection.open_frame(&[]));
            }
            None => debug!(sid = %self.sid, "Upgrade socket opened"),
        }

        let deadline = self.ping_interval + self.ping_timeout;
        ctx.run_interval(self.ping_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > deadline {
                warn!(sid = %act.sid, "Heartbeat timeout, closing connection");
                ctx.stop();
            } else if act.connection.is_some() {
                Self::write(ctx, Connection::ping_frame());
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(connection) = self.connection.as_mut() {
            connection.leave_namespace("transport closed");
            self.state.decrement_active_sessions();
        }
        self.state.polling.forget_upgraded(&self.sid);
        debug!(sid = %self.sid, "Channel session closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChannelSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match self.connection.as_mut() {
                Some(connection) => {
                    let actions = connection.on_text(&text);
                    self.apply(actions, ctx);
                }
                None => self.on_upgrade_text(&text, ctx),
            },
            Ok(ws::Message::Binary(data)) => match self.connection.as_mut() {
                Some(connection) => {
                    let actions = connection.on_binary(data.to_vec());
                    self.apply(actions, ctx);
                }
                None => debug!(sid = %self.sid, "Ignoring binary frame before upgrade"),
            },
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(sid = %self.sid, reason = ?reason, "Websocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(sid = %self.sid, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(sid = %self.sid, error = %err, "Websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<ConversionFinished> for ChannelSession {
    type Result = ();

    fn handle(&mut self, msg: ConversionFinished, ctx: &mut Self::Context) {
        let Some(connection) = self.connection.as_ref() else {
            msg.record(&self.state);
            return;
        };
        for frame in msg.into_frames(connection, &self.state) {
            Self::write(ctx, frame);
        }
    }
}
