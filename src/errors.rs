//! Stream error taxonomy with stable wire codes.
//!
//! Every error that can reach a downstream subscriber carries one of the
//! codes below plus a `recoverable` hint. Codes are part of the wire
//! contract and must not be renamed.

use serde::Serialize;

/// Stable error codes surfaced on SSE and WebSocket error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UpstreamUnavailable,
    UpstreamLost,
    InvalidTickType,
    ContractUnknown,
    StreamLimitReached,
    StreamTimeout,
    SlowConsumer,
    StorageWriteFailed,
    OrphanTick,
    NotConnected,
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::UpstreamLost => "UPSTREAM_LOST",
            ErrorCode::InvalidTickType => "INVALID_TICK_TYPE",
            ErrorCode::ContractUnknown => "CONTRACT_UNKNOWN",
            ErrorCode::StreamLimitReached => "STREAM_LIMIT_REACHED",
            ErrorCode::StreamTimeout => "STREAM_TIMEOUT",
            ErrorCode::SlowConsumer => "SLOW_CONSUMER",
            ErrorCode::StorageWriteFailed => "STORAGE_WRITE_FAILED",
            ErrorCode::OrphanTick => "ORPHAN_TICK",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

/// An error bound for a specific stream or request.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl StreamError {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message, false)
    }

    pub fn upstream_lost() -> Self {
        Self::new(
            ErrorCode::UpstreamLost,
            "upstream connection lost after exhausting reconnect attempts",
            false,
        )
    }

    pub fn invalid_tick_type(label: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTickType,
            format!("unknown tick type: {label}"),
            false,
        )
    }

    pub fn contract_unknown(cid: u32, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ContractUnknown,
            format!("contract {cid} rejected by upstream: {}", detail.into()),
            false,
        )
    }

    pub fn stream_limit(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamLimitReached, detail, false)
    }

    pub fn slow_consumer() -> Self {
        Self::new(
            ErrorCode::SlowConsumer,
            "subscriber queue overflowed; disconnecting",
            false,
        )
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "upstream session not connected", true)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_names() {
        assert_eq!(ErrorCode::SlowConsumer.as_str(), "SLOW_CONSUMER");
        assert_eq!(
            serde_json::to_string(&ErrorCode::UpstreamLost).unwrap(),
            "\"UPSTREAM_LOST\""
        );
    }

    #[test]
    fn test_display_includes_code() {
        let err = StreamError::invalid_tick_type("banana");
        assert!(err.to_string().starts_with("INVALID_TICK_TYPE"));
        assert!(!err.recoverable);
    }
}
