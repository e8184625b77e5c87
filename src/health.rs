//! Health endpoint: liveness plus a snapshot of what the server is running.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let service = &state.service;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "https": config.tls.enabled,
            "namespace": config.channel.namespace
        },
        "model": {
            "name": service.model_name(),
            "n_speakers": service.n_speakers(),
            "devices": service.device_summary()
        },
        "metrics": {
            "connections_total": metrics.connections_total,
            "active_sessions": metrics.active_sessions,
            "polling_sessions": state.polling.len(),
            "conversions_ok": metrics.conversions_ok,
            "conversions_failed": metrics.conversions_failed,
            "error_rate": metrics.error_rate(),
            "average_inference_ms": metrics.average_inference_ms(),
            "errors_by_kind": metrics.errors_by_kind
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "pid": process::id()
    })
}
