//! Backend fault model
//!
//! The backend reports semantic failures as fault markers embedded in an
//! otherwise well-formed response document, not as transport failures. This
//! module holds the typed fault record and the scanner that extracts it.

pub mod scanner;

pub use scanner::{ResponseExceptionScanner, ScanOutcome};

use serde::{Deserialize, Serialize};

/// Backend-reported fault category, keyed by the numeric code the backend
/// puts in the marker's `<type>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Backend-internal failure, potentially transient.
    Internal,
    /// Backend-internal failure after which the backend considers itself unusable.
    InternalFatal,
    /// The request (usually the constraint expression) did not parse.
    UserSyntax,
    /// The caller may not access the named dataset.
    Forbidden,
    /// The named dataset does not exist.
    NotFound,
    /// The backend gave up on the operation.
    Timeout,
    /// A code outside the published vocabulary, preserved verbatim.
    Unrecognized(i32),
}

impl FaultKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => FaultKind::Internal,
            2 => FaultKind::InternalFatal,
            3 => FaultKind::UserSyntax,
            4 => FaultKind::Forbidden,
            5 => FaultKind::NotFound,
            6 => FaultKind::Timeout,
            other => FaultKind::Unrecognized(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FaultKind::Internal => 1,
            FaultKind::InternalFatal => 2,
            FaultKind::UserSyntax => 3,
            FaultKind::Forbidden => 4,
            FaultKind::NotFound => 5,
            FaultKind::Timeout => 6,
            FaultKind::Unrecognized(code) => *code,
        }
    }

    /// Status suggestion for the HTTP layer that fronts this gateway.
    pub fn suggested_http_status(&self) -> u16 {
        match self {
            FaultKind::UserSyntax => 400,
            FaultKind::Forbidden => 403,
            FaultKind::NotFound => 404,
            FaultKind::Timeout => 408,
            FaultKind::Internal | FaultKind::InternalFatal | FaultKind::Unrecognized(_) => 500,
        }
    }

    /// True when the fault blames the request rather than the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FaultKind::UserSyntax | FaultKind::Forbidden | FaultKind::NotFound
        )
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Internal => write!(f, "internal"),
            FaultKind::InternalFatal => write!(f, "internal-fatal"),
            FaultKind::UserSyntax => write!(f, "user-syntax"),
            FaultKind::Forbidden => write!(f, "forbidden"),
            FaultKind::NotFound => write!(f, "not-found"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::Unrecognized(code) => write!(f, "unrecognized({})", code),
        }
    }
}

/// Backend source position attached to a fault marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: String,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One semantic failure reported by the backend.
///
/// Produced only by scanning a fully received response; the session that
/// carried it is still healthy and goes back to the pool after a reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFault {
    pub kind: FaultKind,
    pub message: String,
    pub administrator: Option<String>,
    pub location: Option<SourceLocation>,
}

impl BackendFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            administrator: None,
            location: None,
        }
    }

    pub fn suggested_http_status(&self) -> u16 {
        self.kind.suggested_http_status()
    }

    /// Machine-readable rendering for operator tooling.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.to_string(),
            "code": self.kind.code(),
            "message": self.message,
            "administrator": self.administrator,
            "location": self.location.as_ref().map(|l| l.to_string()),
        })
    }
}

impl std::fmt::Display for BackendFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (reported at {})", location)?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendFault {}
