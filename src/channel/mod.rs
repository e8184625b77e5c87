//! # Event Channel
//!
//! Socket.IO over Engine.IO, the transport the front-end talks to. Clients
//! may open with long-polling and upgrade, or go straight to websocket.
//!
//! ## Key Components:
//! - **packet**: Engine.IO / Socket.IO framing and binary attachments
//! - **message**: conversion records ↔ event arguments
//! - **protocol**: per-connection state machine, no I/O
//! - **dispatch**: conversions on the blocking pool and their replies
//! - **endpoint**: handshake checks and `/socket.io/` routing
//! - **polling**: the long-polling transport and its session registry
//! - **session**: the websocket actor

pub mod dispatch;
pub mod endpoint;
pub mod message;
pub mod packet;
pub mod polling;
pub mod protocol;
pub mod session;

pub use endpoint::configure;
