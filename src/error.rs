//! Error taxonomy per the failure-semantics table: protocol errors are
//! session-fatal, application errors are replied to the client, infra
//! errors are retried internally and never surfaced to a miner as a
//! network failure.

use thiserror::Error;

/// Malformed input on the wire. Fatal to the session that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON line: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("truncated V2 frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
    #[error("unknown V2 message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("string field exceeds 255 bytes")]
    StringTooLong,
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recoverable errors replied to the client as a structured error. The
/// session continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("user not found")]
    UserNotFound,
    #[error("stale job")]
    StaleJob,
    #[error("unknown job")]
    UnknownJob,
    #[error("duplicate share")]
    DuplicateShare,
}

/// Infrastructure hiccups: DB/cache/RPC connectivity. Retried internally
/// per component; never converted into a miner-visible network error.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("rpc circuit breaker open")]
    CircuitOpen,
    #[error("rpc timeout")]
    Timeout,
}

impl InfraError {
    /// Matches spec §4.8's substring classification for connection-class
    /// errors worth retrying across a reconnect.
    pub fn is_transient(message: &str) -> bool {
        const NEEDLES: &[&str] = &[
            "connection refused",
            "no such host",
            "connection reset",
            "broken pipe",
            "eof",
            "i/o timeout",
            "timed out",
        ];
        let lower = message.to_ascii_lowercase();
        NEEDLES.iter().any(|n| lower.contains(n))
    }
}
