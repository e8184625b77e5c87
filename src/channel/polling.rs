//! # Long-Polling Transport
//!
//! Engine.IO v4 over plain HTTP. A stock Socket.IO client opens here and
//! moves to a websocket once the `2probe` exchange succeeds.
//!
//! ## Requests:
//! - `GET` without `sid`: handshake, answered with the OPEN packet
//! - `GET ?sid=..`: waits for queued packets, or sends a ping after
//!   `pingInterval`
//! - `POST ?sid=..`: client packets, answered with `ok`
//!
//! ## Upgrade:
//! The websocket arrives with the same `sid`. `2probe` is answered with
//! `3probe` and the pending poll is released with a noop. On `5` the
//! session's [`Connection`] and anything still queued move into the
//! websocket actor; results of conversions started over polling follow it.

use crate::channel::dispatch::{run_conversion, ConversionFinished};
use crate::channel::endpoint::{check_handshake, HandshakeError, HandshakeQuery, Transport};
use crate::channel::packet::{self, EnginePacket, Frame};
use crate::channel::protocol::{Action, Connection};
use crate::conversion::ConversionRequest;
use crate::error::AppError;
use crate::state::AppState;
use actix::Recipient;
use actix_web::{http::header::ContentType, web, HttpResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Transports a polling session may move to.
const UPGRADES: &[&str] = &["websocket"];

struct PollingSession {
    connection: Connection,
    outbox: Vec<Frame>,
    last_seen: Instant,
    waker: Arc<Notify>,
    upgrading: bool,
}

impl PollingSession {
    fn push(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.outbox.extend(frames);
        self.waker.notify_one();
    }
}

#[derive(Default)]
struct Sessions {
    polling: HashMap<String, PollingSession>,
    /// Sessions now served by a websocket actor
    upgraded: HashMap<String, Recipient<ConversionFinished>>,
}

/// What a `POST` did to its session.
#[derive(Debug, Default)]
pub struct Fed {
    pub requests: Vec<ConversionRequest>,
    /// The client closed the session
    pub closed: bool,
}

/// Long-polling sessions of this process, keyed by Engine.IO sid.
#[derive(Clone, Default)]
pub struct PollingSessions {
    inner: Arc<Mutex<Sessions>>,
}

impl PollingSessions {
    // Sessions hold no invariant a panicking request could break halfway.
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `connection` and return its OPEN frame.
    pub fn open(&self, connection: Connection) -> Frame {
        let frame = connection.open_frame(UPGRADES);
        let session = PollingSession {
            connection,
            outbox: Vec::new(),
            last_seen: Instant::now(),
            waker: Arc::new(Notify::new()),
            upgrading: false,
        };
        self.lock()
            .polling
            .insert(session.connection.engine_sid().to_string(), session);
        frame
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.lock().polling.contains_key(sid)
    }

    pub fn len(&self) -> usize {
        self.lock().polling.len()
    }

    /// Drop sessions that made no request within `idle`. Returns how many.
    pub fn sweep(&self, idle: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.polling.len();
        sessions.polling.retain(|sid, session| {
            if session.last_seen.elapsed() <= idle {
                return true;
            }
            debug!(sid = %sid, "Polling session timed out");
            session.connection.leave_namespace("ping timeout");
            false
        });
        before - sessions.polling.len()
    }

    /// Feed client frames into a session. `None` when the sid is unknown.
    pub fn feed(&self, sid: &str, frames: Vec<Frame>) -> Option<Fed> {
        let mut sessions = self.lock();
        let session = sessions.polling.get_mut(sid)?;
        session.last_seen = Instant::now();

        let mut fed = Fed::default();
        for frame in frames {
            let actions = match frame {
                Frame::Text(text) => session.connection.on_text(&text),
                Frame::Binary(data) => session.connection.on_binary(data),
            };
            for action in actions {
                match action {
                    Action::Send(frame) => session.push([frame]),
                    Action::Convert(request) => fed.requests.push(request),
                    Action::Heartbeat => {}
                    Action::Close => fed.closed = true,
                }
            }
            if fed.closed {
                break;
            }
        }

        if fed.closed {
            if let Some(session) = sessions.polling.remove(sid) {
                session.waker.notify_one();
            }
            fed.requests.clear();
        }
        Some(fed)
    }

    /// Wait up to `wait` for frames to send. A ping goes out when nothing
    /// was queued in time, a noop once an upgrade is under way. `None` when
    /// the sid is unknown.
    pub async fn poll(&self, sid: &str, wait: Duration) -> Option<Vec<Frame>> {
        let deadline = Instant::now() + wait;
        loop {
            let (waker, remaining) = {
                let mut sessions = self.lock();
                let session = sessions.polling.get_mut(sid)?;
                session.last_seen = Instant::now();

                if !session.outbox.is_empty() {
                    return Some(std::mem::take(&mut session.outbox));
                }
                if session.upgrading {
                    return Some(vec![Frame::Text(EnginePacket::Noop.encode())]);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Some(vec![Connection::ping_frame()]);
                }
                (session.waker.clone(), remaining)
            };

            // Woken early by a push; the loop re-checks the outbox
            let _ = tokio::time::timeout(remaining, waker.notified()).await;
        }
    }

    /// Hand a finished conversion to whichever transport serves `sid` now.
    pub fn deliver(&self, sid: &str, finished: ConversionFinished, state: &AppState) {
        let mut guard = self.lock();
        let sessions = &mut *guard;

        if let Some(session) = sessions.polling.get_mut(sid) {
            let frames = finished.into_frames(&session.connection, state);
            session.push(frames);
        } else if let Some(recipient) = sessions.upgraded.get(sid) {
            recipient.do_send(finished);
        } else {
            debug!(sid = %sid, timestamp = finished.timestamp, "Session gone, dropping result");
            finished.record(state);
        }
    }

    /// `2probe` arrived on the websocket: release the pending poll.
    pub fn begin_upgrade(&self, sid: &str) -> bool {
        match self.lock().polling.get_mut(sid) {
            Some(session) => {
                session.upgrading = true;
                session.waker.notify_one();
                true
            }
            None => false,
        }
    }

    /// Move a session onto its websocket. Returns the connection and the
    /// frames still queued for it.
    pub fn complete_upgrade(
        &self,
        sid: &str,
        recipient: Recipient<ConversionFinished>,
    ) -> Option<(Connection, Vec<Frame>)> {
        let mut guard = self.lock();
        let sessions = &mut *guard;

        let session = sessions.polling.remove(sid)?;
        session.waker.notify_one();
        sessions.upgraded.insert(sid.to_string(), recipient);
        Some((session.connection, session.outbox))
    }

    /// The websocket that took over `sid` has stopped.
    pub fn forget_upgraded(&self, sid: &str) {
        self.lock().upgraded.remove(sid);
    }
}

fn idle_limit(state: &AppState) -> Duration {
    let channel = &state.config.channel;
    Duration::from_millis(channel.ping_interval_ms + channel.ping_timeout_ms)
}

fn payload_response(frames: &[Frame]) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(packet::encode_payload(frames))
}

/// `GET` without a sid: open a new polling session.
pub fn handshake(state: &AppState) -> HttpResponse {
    for _ in 0..state.polling.sweep(idle_limit(state)) {
        state.decrement_active_sessions();
    }

    let connection = Connection::new(state.config.channel.clone());
    info!(sid = %connection.engine_sid(), transport = "polling", "Channel session opened");
    state.increment_active_sessions();

    let open = state.polling.open(connection);
    payload_response(&[open])
}

/// `GET ?sid=..`: the long poll.
pub async fn poll(state: &AppState, sid: &str) -> HttpResponse {
    let wait = Duration::from_millis(state.config.channel.ping_interval_ms);
    match state.polling.poll(sid, wait).await {
        Some(frames) => payload_response(&frames),
        None => HandshakeError::UnknownSid.to_response(),
    }
}

/// `POST /socket.io/?transport=polling&sid=..`
pub async fn post_endpoint(
    query: web::Query<HandshakeQuery>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    match check_handshake(&query) {
        Ok(Transport::Polling) => {}
        Ok(Transport::Websocket) => return HandshakeError::BadRequest.to_response(),
        Err(refusal) => return refusal.to_response(),
    }
    let Some(sid) = query.sid.as_deref() else {
        return HandshakeError::BadHandshakeMethod.to_response();
    };

    let frames = std::str::from_utf8(&body)
        .map_err(|e| AppError::Protocol(format!("polling body is not UTF-8: {}", e)))
        .and_then(packet::decode_payload);
    let frames = match frames {
        Ok(frames) => frames,
        Err(e) => {
            warn!(sid = %sid, error = %e, "Dropping undecodable polling body");
            return HandshakeError::BadRequest.to_response();
        }
    };

    let Some(fed) = state.polling.feed(sid, frames) else {
        return HandshakeError::UnknownSid.to_response();
    };
    for request in fed.requests {
        dispatch(&state, sid, request);
    }
    if fed.closed {
        debug!(sid = %sid, "Polling session closed by client");
        state.decrement_active_sessions();
    }

    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body("ok")
}

fn dispatch(state: &AppState, sid: &str, request: ConversionRequest) {
    debug!(
        sid = %sid,
        timestamp = request.timestamp,
        device_selector = request.device_selector,
        bytes = request.payload.len(),
        "Dispatching conversion"
    );

    let state = state.clone();
    let sid = sid.to_string();
    actix_web::rt::spawn(async move {
        let finished = run_conversion(state.service.clone(), request).await;
        state.polling.deliver(&sid, finished, &state);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix::prelude::*;

    fn open(sessions: &PollingSessions) -> String {
        let connection = Connection::new(AppConfig::default().channel);
        let sid = connection.engine_sid().to_string();
        sessions.open(connection);
        sid
    }

    const BINARY_REQUEST: &str =
        r#"451-/test,["request_message",[-1,3,7,42,{"_placeholder":true,"num":0}]]"#;

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    /// Collects the timestamps of results forwarded to it.
    struct Sink(Arc<Mutex<Vec<i64>>>);

    impl Actor for Sink {
        type Context = Context<Self>;
    }

    impl Handler<ConversionFinished> for Sink {
        type Result = ();

        fn handle(&mut self, msg: ConversionFinished, _ctx: &mut Self::Context) {
            self.0.lock().unwrap().push(msg.timestamp);
        }
    }

    #[actix_web::test]
    async fn test_connect_reply_is_polled() {
        let sessions = PollingSessions::default();
        let sid = open(&sessions);

        let fed = sessions.feed(&sid, vec![text("40/test,")]).unwrap();
        assert!(fed.requests.is_empty());
        assert!(!fed.closed);

        let frames = sessions.poll(&sid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Text(t) if t.starts_with("40/test,{\"sid\":")));
    }

    #[actix_web::test]
    async fn test_idle_poll_sends_ping() {
        let sessions = PollingSessions::default();
        let sid = open(&sessions);

        let frames = sessions.poll(&sid, Duration::from_millis(20)).await.unwrap();
        assert_eq!(frames, vec![text("2")]);
        assert!(sessions.poll("nope", Duration::from_millis(20)).await.is_none());
    }

    #[actix_web::test]
    async fn test_binary_request_over_polling() {
        let sessions = PollingSessions::default();
        let sid = open(&sessions);
        sessions.feed(&sid, vec![text("40/test,")]);

        let fed = sessions
            .feed(
                &sid,
                vec![
                    text(BINARY_REQUEST),
                    Frame::Binary(vec![1, 0, 2, 0]),
                ],
            )
            .unwrap();
        assert_eq!(fed.requests.len(), 1);
        assert_eq!(fed.requests[0].timestamp, 42);
        assert_eq!(fed.requests[0].payload, vec![1, 0, 2, 0]);
    }

    #[actix_web::test]
    async fn test_close_removes_session() {
        let sessions = PollingSessions::default();
        let sid = open(&sessions);

        let fed = sessions.feed(&sid, vec![text("40/test,"), text("1")]).unwrap();
        assert!(fed.closed);
        assert!(!sessions.contains(&sid));
        assert!(sessions.feed(&sid, vec![text("2")]).is_none());
    }

    #[actix_web::test]
    async fn test_sweep_drops_idle_sessions() {
        let sessions = PollingSessions::default();
        open(&sessions);
        open(&sessions);

        assert_eq!(sessions.sweep(Duration::from_secs(60)), 0);
        actix_web::rt::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sessions.sweep(Duration::from_millis(5)), 2);
        assert_eq!(sessions.len(), 0);
    }

    #[actix_web::test]
    async fn test_upgrade_moves_session_and_results() {
        let state = crate::state::tests::test_state();
        let sid = open(&state.polling);
        state.polling.feed(&sid, vec![text("40/test,")]);

        assert!(state.polling.begin_upgrade(&sid));
        // The queued connect reply goes out first, then the noop
        let frames = state.polling.poll(&sid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(frames.len(), 1);
        let frames = state.polling.poll(&sid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(frames, vec![text("6")]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Sink(received.clone()).start();
        let (connection, queued) = state.polling.complete_upgrade(&sid, sink.recipient()).unwrap();
        assert!(connection.is_connected());
        assert!(queued.is_empty());
        assert!(!state.polling.contains(&sid));
        assert!(state.polling.poll(&sid, Duration::from_millis(20)).await.is_none());

        state.polling.deliver(
            &sid,
            ConversionFinished {
                timestamp: 7,
                result: Err(AppError::Internal("late".to_string())),
                elapsed_ms: 1,
            },
            &state,
        );
        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*received.lock().unwrap(), vec![7]);

        state.polling.forget_upgraded(&sid);
        state.polling.deliver(
            &sid,
            ConversionFinished {
                timestamp: 8,
                result: Err(AppError::Internal("later".to_string())),
                elapsed_ms: 1,
            },
            &state,
        );
        assert_eq!(state.get_metrics_snapshot().conversions_failed, 1);
    }

    #[test]
    fn test_upgrade_of_unknown_session() {
        let sessions = PollingSessions::default();
        assert!(!sessions.begin_upgrade("missing"));
    }
}
