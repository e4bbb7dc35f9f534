use crate::call::registry::RegistrySummary;
use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let calls = state.call_summary();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "call-agent-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "active_calls": calls.active_calls
        },
        "memory": get_memory_info(),
        "voice": {
            "asr_model": config.asr.model,
            "tts_encoding": config.tts.target_encoding,
            "tts_sample_rate": config.tts.target_sample_rate,
            "dialogue_configured": !config.dialogue.endpoint.trim().is_empty()
        },
        "system": get_system_status(&config, &calls)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let calls = state.call_summary();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "calls": calls,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Load level from how many of the allowed call slots are taken.
fn get_system_status(config: &AppConfig, calls: &RegistrySummary) -> serde_json::Value {
    let call_usage = if calls.max_calls > 0 {
        calls.active_calls as f64 / calls.max_calls as f64
    } else {
        0.0
    };

    let status = if call_usage > 0.9 {
        "high_load"
    } else if call_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if call_usage > 0.8 {
        warnings.push("High call usage - consider increasing max_concurrent_calls");
    }
    if calls.calls_awaiting_handoff > 0 {
        warnings.push("Calls are waiting for a human agent");
    }

    json!({
        "status": status,
        "call_usage_percent": (call_usage * 100.0).round(),
        "max_calls": config.performance.max_concurrent_calls,
        "current_calls": calls.active_calls,
        "calls_awaiting_handoff": calls.calls_awaiting_handoff,
        "load_warnings": warnings
    })
}
