//! Error type for appliance operations, including the classification of CLI
//! failure output into a small, fixed taxonomy.

use thiserror::Error;

/// The kinds a classified appliance error can take. The CSI layer maps these
/// one to one onto gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input violated a documented constraint
    InvalidArgument,
    /// The referenced item does not exist on the appliance
    NotFound,
    /// An item with the same identity already exists
    AlreadyExists,
    /// The appliance is out of disk space
    ResourceExhausted,
    /// Transport-level failure or timeout
    Unavailable,
    /// Anything else reported as a failure
    Internal,
}

/// Errors produced by the appliance client.
#[derive(Error, Debug)]
pub enum Error {
    /// Input validation failed before a command was composed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The appliance reported that the referenced item does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The appliance reported a duplicate item
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The appliance is out of space
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The transport failed or timed out
    #[error("appliance unavailable: {0}")]
    Unavailable(String),

    /// The presented host key did not match the pinned key
    #[error("host key verification failed: {0}")]
    HostKeyMismatch(String),

    /// Unclassified appliance failure
    #[error("appliance error: {0}")]
    Internal(String),
}

impl Error {
    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::HostKeyMismatch(_) => ErrorKind::Internal,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the command that produced this error may be retried. Only
    /// transport-level failures are retryable; classified appliance errors
    /// are not, and a host key mismatch must never be retried through.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

// Classification patterns, checked in order against lowercased output.
// First match wins.
const CLASSIFICATION: &[(&[&str], ErrorKind)] = &[
    (
        &["not enough space", "no space left", "insufficient"],
        ErrorKind::ResourceExhausted,
    ),
    (&["no such item", "not found"], ErrorKind::NotFound),
    (
        &["already exists", "duplicate slot"],
        ErrorKind::AlreadyExists,
    ),
    (&["invalid", "syntax error"], ErrorKind::InvalidArgument),
];

/// Classify a failure message from the appliance into an [`Error`].
///
/// The message is matched case-insensitively against the fixed pattern
/// table; anything that matches nothing becomes `Internal`.
pub fn classify_failure(message: &str) -> Error {
    let haystack = message.to_lowercase();
    for (patterns, kind) in CLASSIFICATION {
        if patterns.iter().any(|p| haystack.contains(p)) {
            let message = message.trim().to_string();
            return match kind {
                ErrorKind::ResourceExhausted => Error::ResourceExhausted(message),
                ErrorKind::NotFound => Error::NotFound(message),
                ErrorKind::AlreadyExists => Error::AlreadyExists(message),
                ErrorKind::InvalidArgument => Error::InvalidArgument(message),
                _ => Error::Internal(message),
            };
        }
    }
    Error::Internal(message.trim().to_string())
}

/// Returns the failure text if the appliance output reports one.
///
/// RouterOS prefixes command failures with `failure:` but prints a bare
/// diagnostic for some parse-level errors, so a handful of known sentinels
/// are treated as failures as well.
pub fn failure_message(output: &str) -> Option<&str> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("failure:") {
            return Some(rest.trim());
        }
        let lowered = trimmed.to_lowercase();
        if lowered.starts_with("syntax error")
            || lowered.starts_with("bad command name")
            || lowered.starts_with("no such item")
            || lowered.starts_with("expected end of command")
            || lowered.starts_with("input does not match")
        {
            return Some(trimmed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_order_is_first_match_wins() {
        // "invalid" appears too, but the space pattern is checked first
        let err = classify_failure("invalid request: not enough space on disk");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(
            classify_failure("No Such Item").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            classify_failure("slot DUPLICATE SLOT detected").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_failure("Syntax Error at offset 3").kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn unmatched_output_is_internal() {
        let err = classify_failure("the appliance caught fire");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(Error::Unavailable("timed out".into()).is_retryable());
        assert!(!Error::NotFound("no such item".into()).is_retryable());
        assert!(!Error::HostKeyMismatch("bad key".into()).is_retryable());
    }

    #[test]
    fn failure_detection() {
        assert_eq!(
            failure_message("failure: no such item"),
            Some("no such item")
        );
        assert_eq!(
            failure_message("syntax error (line 1 column 7)"),
            Some("syntax error (line 1 column 7)")
        );
        assert_eq!(failure_message("Flags: X - disabled\n 0 slot=\"a\""), None);
        assert_eq!(failure_message(""), None);
    }
}
