//! The driver-wide error taxonomy and its mapping onto gRPC status codes.
//!
//! Lower layers produce a [`DriverError`] with an identifying kind and a
//! message carrying the operation and sanitized parameters; the CSI surface
//! converts it into a `tonic::Status`. Outbound messages are scrubbed of
//! appliance addresses, host-key fingerprints, and system paths; the full
//! detail stays in the logs.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Every failure the core can produce.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Caller input violates a documented constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested size is outside the supported bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An idempotent conflict with incompatible parameters.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The referenced object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An attachment conflict outside the grace period, or a missing
    /// prerequisite such as an unstaged volume.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The appliance is out of disk space.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The appliance or the Kubernetes API cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Everything else.
    #[error("internal: {0}")]
    Internal(String),
}

impl DriverError {
    /// The gRPC status code this error maps to.
    pub fn code(&self) -> tonic::Code {
        match self {
            DriverError::InvalidArgument(_) => tonic::Code::InvalidArgument,
            DriverError::OutOfRange(_) => tonic::Code::OutOfRange,
            DriverError::AlreadyExists(_) => tonic::Code::AlreadyExists,
            DriverError::NotFound(_) => tonic::Code::NotFound,
            DriverError::FailedPrecondition(_) => tonic::Code::FailedPrecondition,
            DriverError::ResourceExhausted(_) => tonic::Code::ResourceExhausted,
            DriverError::Unavailable(_) => tonic::Code::Unavailable,
            DriverError::Internal(_) => tonic::Code::Internal,
        }
    }
}

impl From<rds_client::Error> for DriverError {
    fn from(e: rds_client::Error) -> Self {
        let message = e.to_string();
        match e.kind() {
            rds_client::ErrorKind::InvalidArgument => DriverError::InvalidArgument(message),
            rds_client::ErrorKind::NotFound => DriverError::NotFound(message),
            rds_client::ErrorKind::AlreadyExists => DriverError::AlreadyExists(message),
            rds_client::ErrorKind::ResourceExhausted => DriverError::ResourceExhausted(message),
            rds_client::ErrorKind::Unavailable => DriverError::Unavailable(message),
            rds_client::ErrorKind::Internal => DriverError::Internal(message),
        }
    }
}

impl From<DriverError> for tonic::Status {
    fn from(e: DriverError) -> Self {
        tonic::Status::new(e.code(), sanitize(&e.to_string()))
    }
}

lazy_static! {
    static ref IPV4_RE: Regex =
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap();
    static ref FINGERPRINT_RE: Regex = Regex::new(r"SHA256:[A-Za-z0-9+/=]+").unwrap();
    static ref SYSTEM_PATH_RE: Regex =
        Regex::new(r#"/(?:etc|root|home|var/lib/rds-csi)(?:/[^\s"',]*)?"#).unwrap();
}

/// Replaces values that must not leave the process boundary with stable
/// tokens: appliance addresses, host-key fingerprints, and paths under
/// system or credential directories. Mount targets under the kubelet tree
/// are left intact; callers need them to act on errors.
pub fn sanitize(message: &str) -> String {
    let message = IPV4_RE.replace_all(message, "<address>");
    let message = FINGERPRINT_RE.replace_all(&message, "<fingerprint>");
    SYSTEM_PATH_RE.replace_all(&message, "<path>").into_owned()
}
