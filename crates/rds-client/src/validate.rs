//! Validation of every identifier that can end up inside an appliance
//! command. Nothing reaches the command composer without passing through
//! here first.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::Error;

/// Maximum accepted length for a volume ID / slot name.
pub const MAX_VOLUME_ID_LEN: usize = 63;

/// The NQN prefix the appliance exports namespaces under.
pub const NQN_PREFIX: &str = "nqn.2000-02.com.mikrotik:";

lazy_static! {
    static ref VOLUME_ID_RE: Regex = Regex::new(r"^pvc-[0-9a-f-]+$").unwrap();
    static ref SNAPSHOT_NAME_RE: Regex =
        Regex::new(r"^[0-9A-Za-z][0-9A-Za-z._-]*$").unwrap();
}

// Characters that must never appear in a value interpolated into a CLI
// command line.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '"', '\'', '\n', '\r', '<', '>', '(', ')', '{', '}',
];

/// Validate a volume ID (also used verbatim as the appliance slot).
pub fn validate_volume_id(id: &str) -> Result<(), Error> {
    if id.is_empty() || id.len() > MAX_VOLUME_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "volume ID must be 1-{} characters, got {}",
            MAX_VOLUME_ID_LEN,
            id.len()
        )));
    }
    if !VOLUME_ID_RE.is_match(id) {
        return Err(Error::InvalidArgument(format!(
            "volume ID {:?} does not match pvc-<hex-and-dashes>",
            id
        )));
    }
    Ok(())
}

/// Validate a snapshot name as supplied by the orchestrator.
pub fn validate_snapshot_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_VOLUME_ID_LEN {
        return Err(Error::InvalidArgument(format!(
            "snapshot name must be 1-{} characters",
            MAX_VOLUME_ID_LEN
        )));
    }
    if !SNAPSHOT_NAME_RE.is_match(name) {
        return Err(Error::InvalidArgument(format!(
            "snapshot name {:?} contains unsupported characters",
            name
        )));
    }
    Ok(())
}

/// Validate an appliance file path and check that it stays inside `base`.
///
/// Appliance paths are slash-separated but not rooted at `/`; `raid1/csi`
/// is a valid base. Normalization rejects rather than resolves `.` and
/// `..` components, so a path that passes is already in canonical form.
pub fn validate_file_path(path: &str, base: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("file path is empty".into()));
    }
    if let Some(c) = path.chars().find(|c| {
        SHELL_METACHARACTERS.contains(c) || c.is_whitespace() || c.is_control()
    }) {
        return Err(Error::InvalidArgument(format!(
            "file path contains forbidden character {:?}",
            c
        )));
    }
    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(Error::InvalidArgument(format!(
            "file path {:?} is not normalized",
            path
        )));
    }
    let prefix = format!("{}/", base.trim_end_matches('/'));
    if !path.starts_with(&prefix) {
        return Err(Error::InvalidArgument(format!(
            "file path {:?} escapes the configured base path",
            path
        )));
    }
    Ok(())
}

/// Validate an NQN and check that it carries the given volume ID.
pub fn validate_nqn(nqn: &str, volume_id: &str) -> Result<(), Error> {
    let expected = format!("{}{}", NQN_PREFIX, volume_id);
    if nqn != expected {
        return Err(Error::InvalidArgument(format!(
            "NQN {:?} does not match the appliance format for volume {}",
            nqn, volume_id
        )));
    }
    Ok(())
}

/// Validate a dotted-quad IPv4 address.
pub fn validate_address(address: &str) -> Result<(), Error> {
    address
        .parse::<std::net::Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| {
            Error::InvalidArgument(format!(
                "address {:?} is not a dotted-quad IPv4 address",
                address
            ))
        })
}

/// Validate a TCP port.
pub fn validate_port(port: u32) -> Result<u16, Error> {
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(Error::InvalidArgument(format!(
            "port {} is outside [1, 65535]",
            port
        )));
    }
    Ok(port as u16)
}
