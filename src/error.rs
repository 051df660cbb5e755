//! Error types for the Tor client
//!
//! This module provides the client-wide error taxonomy:
//! - Detailed error variants for different failure modes
//! - Classification into kinds (crypto, protocol, network, ...)
//! - Fatal vs retryable distinction
//! - SOCKS5 reply code mapping for the front door

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Coarse error kinds for propagation policy decisions.
///
/// Crypto and Protocol are never retried on the same circuit; the affected
/// circuit is destroyed. Network errors drop the link. Timeout and Cancelled
/// are operation-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Configuration validation failure at startup
    Config,
    /// Cannot obtain a valid consensus
    Bootstrap,
    /// Handshake MAC mismatch, signature failure, malformed key, digest mismatch
    Crypto,
    /// Cell violates format or state machine
    Protocol,
    /// TLS error, TCP reset, read/write failure
    Network,
    /// A step exceeded its deadline
    Timeout,
    /// Operation refused by configuration
    Policy,
    /// MaxCircuits reached, stream-id space exhausted, too many pools
    Resource,
    /// Cooperative cancellation
    Cancelled,
}

/// Main error type for the Tor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Configuration =====
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ===== Bootstrap / directory =====
    #[error("All directory authorities failed: {0}")]
    AllAuthoritiesFailed(String),

    #[error("Consensus is stale (past valid-until)")]
    ConsensusStale,

    #[error("Consensus signature quorum not met: {got} of {need} required signatures")]
    SignatureQuorumFail { got: usize, need: usize },

    #[error("Directory error: {0}")]
    Directory(String),

    // ===== Crypto =====
    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Relay cell digest mismatch")]
    DigestMismatch,

    #[error("Handshake AUTH verification failed")]
    AuthMismatch,

    // ===== Protocol =====
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Circuit destroyed by peer: reason={reason} ({})", destroy_reason_name(*.reason))]
    CircuitDestroyed { reason: u8 },

    // ===== Network =====
    #[error("Network error: {0}")]
    Network(String),

    #[error("Link connection failed: {0}")]
    LinkDown(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // ===== Timeouts =====
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Circuit build timed out")]
    BuildTimeout,

    // ===== Circuit / stream =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit extension refused: {0}")]
    ExtendRefused(String),

    #[error("Circuit closed")]
    CircuitClosed,

    #[error("Stream target refused: END reason={reason}")]
    TargetRefused { reason: u8 },

    #[error("Stream error: {0}")]
    Stream(String),

    // ===== Policy =====
    #[error("No usable path: {0}")]
    NoPathAvailable(String),

    #[error("Refused by policy: {0}")]
    Policy(String),

    #[error("Unsupported onion address: {0}")]
    UnsupportedOnionVersion(String),

    #[error("Invalid onion address: {0}")]
    InvalidOnionAddress(String),

    // ===== Onion service =====
    #[error("Onion descriptor unavailable: all HSDirs failed")]
    DescriptorUnavailable,

    #[error("Onion descriptor invalid: {0}")]
    DescriptorInvalid(String),

    #[error("Introduction failed: INTRODUCE_ACK status={status}")]
    IntroFailure { status: u16 },

    #[error("No introduction points left to try")]
    NoIntroPointsLeft,

    // ===== Resources =====
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ===== Cancellation =====
    #[error("Operation cancelled")]
    Cancelled,

    // ===== Internal =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Classify this error into the propagation-policy taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorError::Config(_) => ErrorKind::Config,

            TorError::AllAuthoritiesFailed(_)
            | TorError::ConsensusStale
            | TorError::SignatureQuorumFail { .. }
            | TorError::Directory(_) => ErrorKind::Bootstrap,

            TorError::Crypto(_) | TorError::DigestMismatch | TorError::AuthMismatch => {
                ErrorKind::Crypto
            }

            TorError::Protocol(_)
            | TorError::UnexpectedCell { .. }
            | TorError::CircuitDestroyed { .. }
            | TorError::DescriptorInvalid(_) => ErrorKind::Protocol,

            TorError::Network(_) | TorError::LinkDown(_) | TorError::Tls(_) => ErrorKind::Network,

            TorError::Timeout(_) | TorError::BuildTimeout => ErrorKind::Timeout,

            TorError::NoPathAvailable(_)
            | TorError::Policy(_)
            | TorError::UnsupportedOnionVersion(_)
            | TorError::InvalidOnionAddress(_) => ErrorKind::Policy,

            TorError::ResourceExhausted(_) => ErrorKind::Resource,

            TorError::Cancelled => ErrorKind::Cancelled,

            TorError::CircuitBuildFailed(_)
            | TorError::ExtendRefused(_)
            | TorError::CircuitClosed
            | TorError::TargetRefused { .. }
            | TorError::Stream(_)
            | TorError::DescriptorUnavailable
            | TorError::IntroFailure { .. }
            | TorError::NoIntroPointsLeft => ErrorKind::Network,

            TorError::Internal(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the affected circuit must be destroyed with no retry on it.
    ///
    /// Crypto and Protocol errors indicate adversarial or buggy behavior.
    pub fn is_fatal_for_circuit(&self) -> bool {
        matches!(self.kind(), ErrorKind::Crypto | ErrorKind::Protocol)
    }

    /// Whether the operation may be retried on a fresh circuit or path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Bootstrap
        )
    }

    /// Map this error to a SOCKS5 reply code (RFC 1928 §6).
    pub fn socks5_reply(&self) -> u8 {
        match self {
            TorError::TargetRefused { .. } => 0x05,
            TorError::Timeout(_) | TorError::BuildTimeout => 0x06,
            TorError::NoPathAvailable(_) => 0x03,
            TorError::UnsupportedOnionVersion(_) | TorError::InvalidOnionAddress(_) => 0x08,
            _ => 0x01,
        }
    }
}

/// Name table for DESTROY reason bytes (tor-spec §5.4).
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        TorError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(TorError::DigestMismatch.kind(), ErrorKind::Crypto);
        assert_eq!(TorError::AuthMismatch.kind(), ErrorKind::Crypto);
        assert_eq!(
            TorError::Protocol("bad cell".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(TorError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(TorError::BuildTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(TorError::ConsensusStale.kind(), ErrorKind::Bootstrap);
    }

    #[test]
    fn test_fatal_for_circuit() {
        assert!(TorError::DigestMismatch.is_fatal_for_circuit());
        assert!(TorError::Protocol("x".into()).is_fatal_for_circuit());
        assert!(!TorError::Network("reset".into()).is_fatal_for_circuit());
        assert!(!TorError::BuildTimeout.is_fatal_for_circuit());
    }

    #[test]
    fn test_socks5_reply_mapping() {
        assert_eq!(TorError::TargetRefused { reason: 1 }.socks5_reply(), 0x05);
        assert_eq!(TorError::Timeout("open".into()).socks5_reply(), 0x06);
        assert_eq!(TorError::NoPathAvailable("no exit".into()).socks5_reply(), 0x03);
        assert_eq!(
            TorError::UnsupportedOnionVersion("v2".into()).socks5_reply(),
            0x08
        );
        assert_eq!(TorError::Internal("bug".into()).socks5_reply(), 0x01);
    }

    #[test]
    fn test_destroy_reason_names() {
        assert_eq!(destroy_reason_name(0), "NONE");
        assert_eq!(destroy_reason_name(1), "PROTOCOL");
        assert_eq!(destroy_reason_name(12), "NOSUCHSERVICE");
        assert_eq!(destroy_reason_name(200), "UNKNOWN");
    }
}
