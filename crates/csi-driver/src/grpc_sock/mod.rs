//! Unix domain socket support for the tonic gRPC server. Socket support is
//! not built in to tonic, so this provides a `Connected` stream the server
//! can accept from, plus endpoint parsing for the `unix://` and TCP forms.

pub mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

/// Where the CSI server should listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A Unix domain socket path.
    Unix(PathBuf),
    /// A TCP socket address.
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Parses `unix:///path`, a bare absolute path, or a `host:port` pair.
    pub fn parse(raw: &str) -> Result<Self, crate::error::DriverError> {
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(crate::error::DriverError::InvalidArgument(
                    "empty unix socket path in endpoint".into(),
                ));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(raw)));
        }
        raw.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|_| {
                crate::error::DriverError::InvalidArgument(format!(
                    "endpoint {:?} is neither a unix socket path nor a TCP address",
                    raw
                ))
            })
    }
}
