//! Mapping between conversion records and Socket.IO event arguments.
//!
//! Inbound `request_message` arrives as one array argument
//! `[deviceSelector, sourceSpeakerId, targetSpeakerId, timestamp, payload]`
//! or as the same five values spread over five arguments. The payload is
//! a binary placeholder resolved against the event's attachments.

use crate::channel::packet::{placeholder, placeholder_index};
use crate::conversion::{ConversionRequest, ConversionResponse};
use crate::error::{AppError, AppResult};
use serde_json::{json, Value};

pub const REQUEST_EVENT: &str = "request_message";
pub const RESPONSE_EVENT: &str = "response";
pub const ERROR_EVENT: &str = "response_error";

const REQUEST_FIELDS: usize = 5;

/// Build a request from the arguments of a `request_message` event.
pub fn parse_request(args: &[Value], attachments: &[Vec<u8>]) -> AppResult<ConversionRequest> {
    let fields = request_fields(args)?;

    Ok(ConversionRequest {
        device_selector: integer(&fields[0], "deviceSelector")?,
        source_speaker_id: integer(&fields[1], "sourceSpeakerId")?,
        target_speaker_id: integer(&fields[2], "targetSpeakerId")?,
        timestamp: integer(&fields[3], "timestamp")?,
        payload: bytes(&fields[4], attachments)?,
    })
}

/// Best-effort timestamp of a request that failed to parse, so the error
/// event can still be correlated by the client.
pub fn peek_timestamp(args: &[Value]) -> Option<i64> {
    let fields = request_fields(args).ok()?;
    integer(&fields[3], "timestamp").ok()
}

/// Arguments and attachments of the `response` event.
pub fn response_args(response: ConversionResponse) -> (Vec<Value>, Vec<Vec<u8>>) {
    (
        vec![json!([response.timestamp, placeholder(0)])],
        vec![response.payload],
    )
}

/// Arguments of the `response_error` event.
pub fn error_args(timestamp: Option<i64>, error: &AppError) -> Vec<Value> {
    vec![json!([timestamp, error.to_event_payload()])]
}

fn request_fields(args: &[Value]) -> AppResult<&[Value]> {
    let fields = match args {
        [Value::Array(inner)] => inner.as_slice(),
        flat => flat,
    };

    if fields.len() != REQUEST_FIELDS {
        return Err(AppError::Validation(format!(
            "{} expects {} fields, got {}",
            REQUEST_EVENT,
            REQUEST_FIELDS,
            fields.len()
        )));
    }
    Ok(fields)
}

/// JSON integers, plus floats with an integral value.
fn integer(value: &Value, field: &str) -> AppResult<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            return Ok(f as i64);
        }
    }
    Err(AppError::Validation(format!("{} must be an integer, got {}", field, value)))
}

fn bytes(value: &Value, attachments: &[Vec<u8>]) -> AppResult<Vec<u8>> {
    let index = placeholder_index(value)
        .ok_or_else(|| AppError::Validation(format!("payload must be binary, got {}", value)))?;
    attachments
        .get(index)
        .cloned()
        .ok_or_else(|| AppError::Protocol(format!("binary attachment {} is missing", index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> Vec<Vec<u8>> {
        vec![vec![0x01, 0x00, 0x02, 0x00]]
    }

    #[test]
    fn test_parse_single_array_argument() {
        let args = vec![json!([-1, 3, 7, 42, placeholder(0)])];
        let request = parse_request(&args, &attachment()).unwrap();

        assert_eq!(
            request,
            ConversionRequest {
                device_selector: -1,
                source_speaker_id: 3,
                target_speaker_id: 7,
                timestamp: 42,
                payload: vec![0x01, 0x00, 0x02, 0x00],
            }
        );
    }

    #[test]
    fn test_parse_flat_arguments() {
        let args = vec![json!(0), json!(1), json!(2), json!(1_700_000_000_123i64), placeholder(0)];
        let request = parse_request(&args, &attachment()).unwrap();
        assert_eq!(request.device_selector, 0);
        assert_eq!(request.timestamp, 1_700_000_000_123);
    }

    #[test]
    fn test_integral_floats_are_accepted() {
        // JavaScript clients often send Date.now() through float paths
        let args = vec![json!([-1.0, 3, 7.0, 42.0, placeholder(0)])];
        let request = parse_request(&args, &attachment()).unwrap();
        assert_eq!(request.device_selector, -1);
        assert_eq!(request.target_speaker_id, 7);
    }

    #[test]
    fn test_rejects_bad_fields() {
        let cases = vec![
            vec![json!([-1, 3, 7, placeholder(0)])],
            vec![json!([-1, 3.5, 7, 42, placeholder(0)])],
            vec![json!([-1, "3", 7, 42, placeholder(0)])],
            vec![json!([-1, 3, 7, 42, [1, 0, 2, 0]])],
        ];
        for args in cases {
            let err = parse_request(&args, &attachment()).unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{:?}", args);
        }
    }

    #[test]
    fn test_missing_attachment() {
        let args = vec![json!([-1, 3, 7, 42, placeholder(1)])];
        let err = parse_request(&args, &attachment()).unwrap_err();
        assert!(matches!(err, AppError::Protocol(_)));
    }

    #[test]
    fn test_peek_timestamp() {
        assert_eq!(peek_timestamp(&[json!([-1, 3, 7, 42, "not bytes"])]), Some(42));
        assert_eq!(peek_timestamp(&[json!([1, 2])]), None);
    }

    #[test]
    fn test_response_and_error_args() {
        let (args, attachments) = response_args(ConversionResponse {
            timestamp: 42,
            payload: vec![9, 9],
        });
        assert_eq!(args, vec![json!([42, {"_placeholder": true, "num": 0}])]);
        assert_eq!(attachments, vec![vec![9, 9]]);

        let err = AppError::Device("accelerator 3 not present".to_string());
        assert_eq!(
            error_args(None, &err),
            vec![json!([null, {"type": "device_error", "message": "accelerator 3 not present"}])]
        );
    }
}
