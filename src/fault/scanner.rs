//! Fault-marker extraction from captured backend responses.
//!
//! The central asymmetry of the backend protocol: a transport-level exchange
//! can complete cleanly while the response body carries a `<serviceError>`
//! marker. Every document product is captured and run through this scanner
//! before it is relayed; only the bulk-data streaming path is exempt.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{BackendFault, FaultKind, SourceLocation};

static FAULT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<serviceError\b[^>]*>(.*?)</serviceError>").expect("fault marker pattern")
});
static TYPE_EL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<type>\s*(-?\d+)\s*</type>").expect("type pattern"));
static MESSAGE_EL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<message>(.*?)</message>").expect("message pattern"));
static ADMIN_EL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<administrator>(.*?)</administrator>").expect("admin pattern"));
static FILE_EL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<file>(.*?)</file>").expect("file pattern"));
static LINE_EL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<line>(.*?)</line>").expect("line pattern"));

const MESSAGE_MISSING: &str = "backend reported an error without a message";

/// Result of scanning one materialized response.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// No fault markers; the document may be relayed as-is.
    Clean,
    /// One or more markers found, merged into a single fault.
    Fault(BackendFault),
}

impl ScanOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanOutcome::Clean)
    }

    pub fn into_fault(self) -> Option<BackendFault> {
        match self {
            ScanOutcome::Clean => None,
            ScanOutcome::Fault(fault) => Some(fault),
        }
    }
}

/// Scans captured response buffers for embedded fault markers.
pub struct ResponseExceptionScanner;

impl ResponseExceptionScanner {
    /// Scan a captured response document.
    ///
    /// Multiple markers merge into one fault: the first marker's kind,
    /// administrator, and location win; messages concatenate in document
    /// order.
    pub fn scan(document: &[u8]) -> ScanOutcome {
        let text = String::from_utf8_lossy(document);

        let mut merged: Option<BackendFault> = None;
        for marker in FAULT_MARKER.captures_iter(&text) {
            let body = &marker[1];
            let message = child_text(body, &MESSAGE_EL)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| MESSAGE_MISSING.to_string());

            match merged.as_mut() {
                None => {
                    let kind = TYPE_EL
                        .captures(body)
                        .and_then(|c| c[1].parse::<i32>().ok())
                        .map(FaultKind::from_code)
                        .unwrap_or(FaultKind::Unrecognized(-1));
                    let mut fault = BackendFault::new(kind, message);
                    fault.administrator = child_text(body, &ADMIN_EL).filter(|a| !a.is_empty());
                    fault.location = location_of(body);
                    merged = Some(fault);
                }
                Some(fault) => {
                    fault.message.push('\n');
                    fault.message.push_str(&message);
                }
            }
        }

        match merged {
            None => ScanOutcome::Clean,
            Some(fault) => ScanOutcome::Fault(fault),
        }
    }

    /// Convert out-of-band error-channel content into a fault.
    ///
    /// The channel normally carries a fault document, but an unparsable
    /// payload still becomes a fault with the raw text as its message. The
    /// error channel never turns into a silent success.
    pub fn scan_error_channel(raw: &[u8]) -> BackendFault {
        match Self::scan(raw) {
            ScanOutcome::Fault(fault) => fault,
            ScanOutcome::Clean => {
                let text = String::from_utf8_lossy(raw);
                let trimmed = text.trim();
                let message = if trimmed.is_empty() {
                    MESSAGE_MISSING.to_string()
                } else {
                    trimmed.to_string()
                };
                BackendFault::new(FaultKind::Unrecognized(-1), message)
            }
        }
    }
}

fn child_text(body: &str, pattern: &Regex) -> Option<String> {
    pattern
        .captures(body)
        .map(|c| unescape_text(c[1].trim()))
}

fn location_of(body: &str) -> Option<SourceLocation> {
    let file = child_text(body, &FILE_EL)?;
    let line = child_text(body, &LINE_EL).unwrap_or_default();
    Some(SourceLocation { file, line })
}

/// Decode the five predefined entities in extracted text. `&amp;` goes last
/// so already-decoded ampersands cannot re-form an entity.
fn unescape_text(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
