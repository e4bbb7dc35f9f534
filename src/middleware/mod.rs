pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;

/// The call id segment of `/api/v1/calls/{call_id}/...` or `/ws/calls/{call_id}`.
pub fn call_id_from_path(path: &str) -> Option<&str> {
    let rest = path
        .strip_prefix("/api/v1/calls/")
        .or_else(|| path.strip_prefix("/ws/calls/"))?;
    let call_id = rest.split('/').next()?;

    // "events" is a route of its own, not a call
    match call_id {
        "" | "events" => None,
        call_id => Some(call_id),
    }
}

/// Replace the call id in a path with a placeholder so metrics group by route.
pub fn route_pattern(path: &str) -> String {
    for prefix in ["/api/v1/calls/", "/ws/calls/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if call_id_from_path(path).is_some() {
                let tail = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
                return format!("{}{{call_id}}{}", prefix, tail);
            }
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_extraction() {
        assert_eq!(call_id_from_path("/api/v1/calls/abc-1"), Some("abc-1"));
        assert_eq!(call_id_from_path("/api/v1/calls/abc-1/asr/reset"), Some("abc-1"));
        assert_eq!(call_id_from_path("/ws/calls/xyz"), Some("xyz"));
        assert_eq!(call_id_from_path("/api/v1/calls/events"), None);
        assert_eq!(call_id_from_path("/api/v1/calls"), None);
        assert_eq!(call_id_from_path("/health"), None);
    }

    #[test]
    fn test_route_pattern() {
        assert_eq!(route_pattern("/api/v1/calls/abc-1/asr/reset"), "/api/v1/calls/{call_id}/asr/reset");
        assert_eq!(route_pattern("/ws/calls/xyz"), "/ws/calls/{call_id}");
        assert_eq!(route_pattern("/api/v1/calls/events"), "/api/v1/calls/events");
        assert_eq!(route_pattern("/api/v1/calls/api"), "/api/v1/calls/{call_id}");
    }
}
