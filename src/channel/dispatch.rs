//! Conversions leave the connection here: they run on the blocking pool and
//! come back as one [`ConversionFinished`], which either transport turns
//! into `response` / `response_error` frames.

use crate::channel::packet::Frame;
use crate::channel::protocol::Connection;
use crate::conversion::{ConversionRequest, ConversionResponse, ConversionService};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix::Message;
use actix_web::web;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A conversion finished on the blocking pool.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ConversionFinished {
    pub timestamp: i64,
    pub result: AppResult<ConversionResponse>,
    pub elapsed_ms: u64,
}

/// Run `request` through the service off the async workers.
pub async fn run_conversion(
    service: Arc<ConversionService>,
    request: ConversionRequest,
) -> ConversionFinished {
    let timestamp = request.timestamp;
    let start = Instant::now();

    let result = match web::block(move || service.convert(&request)).await {
        Ok(result) => result,
        Err(e) => Err(AppError::Internal(format!("conversion task failed: {}", e))),
    };

    ConversionFinished {
        timestamp,
        result,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

impl ConversionFinished {
    pub fn record(&self, state: &AppState) {
        match &self.result {
            Ok(_) => state.record_conversion(self.elapsed_ms),
            Err(err) => state.record_conversion_error(err.kind()),
        }
    }

    /// Record the outcome and build the frames for `connection`. Nothing is
    /// sent once the client has left the namespace.
    pub fn into_frames(self, connection: &Connection, state: &AppState) -> Vec<Frame> {
        self.record(state);

        if let Err(err) = &self.result {
            warn!(
                sid = %connection.engine_sid(),
                timestamp = self.timestamp,
                kind = err.kind(),
                error = %err,
                "Conversion failed"
            );
        }

        if !connection.is_connected() {
            debug!(timestamp = self.timestamp, "Client left the namespace, dropping result");
            return Vec::new();
        }

        match self.result {
            Ok(response) => connection.response_frames(response),
            Err(err) => connection.error_frames(Some(self.timestamp), &err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    fn request(payload: Vec<u8>) -> ConversionRequest {
        ConversionRequest {
            device_selector: -1,
            source_speaker_id: 3,
            target_speaker_id: 7,
            timestamp: 42,
            payload,
        }
    }

    fn connected() -> Connection {
        let mut conn = Connection::new(crate::config::AppConfig::default().channel);
        conn.on_text("40/test,");
        conn
    }

    #[actix_web::test]
    async fn test_conversion_comes_back_as_response() {
        let state = test_state();
        let request = request(vec![0x01, 0x00, 0x02, 0x00]);
        let finished = run_conversion(state.service.clone(), request).await;
        assert_eq!(finished.timestamp, 42);
        assert!(finished.result.is_ok());

        let frames = finished.into_frames(&connected(), &state);
        assert_eq!(frames.len(), 2);
        let Frame::Text(header) = &frames[0] else {
            panic!("event header must be text");
        };
        assert!(header.starts_with(r#"451-/test,["response",[42,{"_placeholder":true"#));
        assert!(matches!(&frames[1], Frame::Binary(pcm) if !pcm.is_empty()));
        assert_eq!(state.get_metrics_snapshot().conversions_ok, 1);
    }

    #[actix_web::test]
    async fn test_failed_conversion_comes_back_as_error_event() {
        let state = test_state();
        let request = request(vec![0x01, 0x00, 0x02]);
        let finished = run_conversion(state.service.clone(), request).await;
        assert!(matches!(finished.result, Err(AppError::Validation(_))));

        let frames = finished.into_frames(&connected(), &state);
        assert_eq!(frames.len(), 1);
        let Frame::Text(text) = &frames[0] else {
            panic!("error event must be text");
        };
        assert!(text.starts_with(r#"42/test,["response_error",[42,{"#));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.conversions_failed, 1);
        assert_eq!(metrics.errors_by_kind["validation_error"], 1);
    }

    #[actix_web::test]
    async fn test_result_after_leaving_namespace_is_dropped() {
        let state = test_state();
        let mut conn = connected();
        let finished = run_conversion(state.service.clone(), request(vec![0; 480])).await;

        conn.leave_namespace("client disconnect");
        assert!(finished.into_frames(&conn, &state).is_empty());
        assert_eq!(state.get_metrics_snapshot().conversions_ok, 1);
    }
}
