//! W3C trace context carried on queue tasks
//!
//! The API front captures the incoming `traceparent`/`tracestate` pair at
//! admission; workers resume it so provider calls correlate with the
//! original request.

use serde::{Deserialize, Serialize};

/// `traceparent` + `tracestate` string pair. Values are carried opaquely;
/// only the traceparent is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Extracts the pair from request headers, dropping a malformed
    /// traceparent rather than propagating garbage downstream.
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let traceparent = headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .filter(|v| is_valid_traceparent(v))
            .map(str::to_owned);
        // tracestate is meaningless without a parent to attach it to
        let tracestate = if traceparent.is_some() {
            headers
                .get("tracestate")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        } else {
            None
        };
        Self { traceparent, tracestate }
    }

    /// 32-hex trace id from the traceparent, for log correlation.
    pub fn trace_id(&self) -> Option<&str> {
        self.traceparent.as_deref().map(|tp| &tp[3..35])
    }
}

/// version "00" format: `00-{32 hex}-{16 hex}-{2 hex}`
fn is_valid_traceparent(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 {
        return false;
    }
    let hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    hex(parts[0], 2)
        && hex(parts[1], 32)
        && hex(parts[2], 16)
        && hex(parts[3], 2)
        && parts[1].bytes().any(|b| b != b'0')
        && parts[2].bytes().any(|b| b != b'0')
}
