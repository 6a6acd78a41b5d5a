//! Error taxonomy for the gateway core.
//!
//! Two layers: `TransportError` covers everything that can go wrong on the
//! wire to the backend, `GatewayError` is what callers of the pool and the
//! transaction runner see. The split that matters operationally: a
//! `Transport` failure destroys its session, a `Fault` does not.

use thiserror::Error;

use crate::fault::BackendFault;

/// Failures establishing or using one backend connection.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connect to {host}:{port} failed: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    /// Connection attempt exceeded the configured connect timeout.
    #[error("connect to {host}:{port} timed out after {waited_ms}ms")]
    ConnectTimeout {
        host: String,
        port: u16,
        waited_ms: u64,
    },

    /// The backend answered the greeting with something other than the
    /// acceptance line.
    #[error("backend at {host}:{port} rejected the session handshake: {answer:?}")]
    HandshakeRejected {
        host: String,
        port: u16,
        answer: String,
    },

    /// I/O failure mid-session.
    #[error("i/o failure while {context}: {message}")]
    Io {
        context: &'static str,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// The peer sent a chunk header that does not follow the framing rules.
    #[error("malformed chunk header: {detail}")]
    BadFrame { detail: String },

    /// A single chunk advertised more payload than the framing allows.
    #[error("chunk of {size} bytes exceeds the {limit} byte limit")]
    OversizedChunk { size: usize, limit: usize },

    /// A captured document outgrew the configured capture cap.
    #[error("captured response of {size} bytes exceeds the {limit} byte limit")]
    ResponseTooLarge { size: usize, limit: usize },

    /// Operation attempted on a session that was already closed.
    #[error("session is closed")]
    SessionClosed,
}

impl TransportError {
    /// Wrap an I/O error with the operation that hit it.
    pub fn io(context: &'static str, err: &std::io::Error) -> Self {
        TransportError::Io {
            context,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True when the backend process itself looks unreachable, as opposed to
    /// a protocol problem on an established connection.
    pub fn is_backend_unreachable(&self) -> bool {
        match self {
            TransportError::Connect { .. }
            | TransportError::ConnectTimeout { .. }
            | TransportError::HandshakeRejected { .. } => true,
            TransportError::Io { kind, .. } => matches!(
                kind,
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            TransportError::BadFrame { .. }
            | TransportError::OversizedChunk { .. }
            | TransportError::ResponseTooLarge { .. }
            | TransportError::SessionClosed => false,
        }
    }
}

/// What callers of `SessionPool` and `TransactionRunner` see.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The pool was used before `configure` succeeded.
    #[error("session pool is not configured")]
    NotConfigured,

    /// Bounded checkout wait elapsed with the pool still saturated.
    #[error("session checkout timed out after {waited_ms}ms (capacity {capacity})")]
    CheckoutTimeout { waited_ms: u64, capacity: usize },

    /// Checkout attempted after shutdown began.
    #[error("session pool is shutting down")]
    ShuttingDown,

    /// Connection-level failure; the session involved was destroyed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Semantic failure reported inside a well-formed response; the session
    /// involved went back to the pool.
    #[error("backend fault: {0}")]
    Fault(#[from] BackendFault),

    /// The transaction deadline elapsed during the streaming phase.
    #[error("response streaming exceeded the {limit_ms}ms transaction deadline")]
    StreamTimeout { limit_ms: u64 },
}

impl GatewayError {
    /// Whether the session that carried this error must be destroyed rather
    /// than returned to the idle set.
    pub fn destroys_session(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::StreamTimeout { .. } => true,
            GatewayError::Fault(_) => false,
            // No session was involved yet.
            GatewayError::NotConfigured
            | GatewayError::CheckoutTimeout { .. }
            | GatewayError::ShuttingDown => false,
        }
    }

    /// Service-unavailable style failure, i.e. the backend process is the
    /// problem rather than the request.
    pub fn is_backend_unreachable(&self) -> bool {
        match self {
            GatewayError::Transport(t) => t.is_backend_unreachable(),
            _ => false,
        }
    }

    /// Status suggestion for the HTTP layer fronting this gateway.
    pub fn suggested_http_status(&self) -> u16 {
        match self {
            GatewayError::NotConfigured => 500,
            GatewayError::CheckoutTimeout { .. } | GatewayError::ShuttingDown => 503,
            GatewayError::Transport(_) => 502,
            GatewayError::Fault(fault) => fault.suggested_http_status(),
            GatewayError::StreamTimeout { .. } => 504,
        }
    }
}
