//! Mount option policy. Options are parsed one by one against an explicit
//! whitelist; `nosuid,nodev,noexec` are always applied and the dangerous
//! inverses are always rejected, before anything reaches a mount syscall.

use crate::error::DriverError;

/// Options applied to every mount the driver performs.
pub const REQUIRED_OPTIONS: &[&str] = &["nosuid", "nodev", "noexec"];

// Always rejected, whatever else says otherwise.
const DENIED_OPTIONS: &[&str] = &["suid", "dev", "exec"];

// Bare flags callers may request.
const ALLOWED_FLAGS: &[&str] = &[
    "ro",
    "rw",
    "noatime",
    "nodiratime",
    "relatime",
    "strictatime",
    "lazytime",
    "sync",
    "dirsync",
    "discard",
    "nodiscard",
    "nosuid",
    "nodev",
    "noexec",
];

// key=value options callers may request, by key.
const ALLOWED_KEYED: &[&str] = &["commit", "data", "errors", "inode64", "allocsize", "logbufs"];

/// Validates requested options and returns the effective set: the accepted
/// request plus [`REQUIRED_OPTIONS`], deduplicated, order preserved.
pub fn build_mount_options(requested: &[String]) -> Result<Vec<String>, DriverError> {
    let mut effective: Vec<String> = Vec::with_capacity(requested.len() + REQUIRED_OPTIONS.len());

    for raw in requested {
        let option = raw.trim();
        if option.is_empty() {
            return Err(DriverError::InvalidArgument(
                "empty mount option requested".into(),
            ));
        }
        if DENIED_OPTIONS.contains(&option) {
            return Err(DriverError::InvalidArgument(format!(
                "mount option {:?} is not permitted",
                option
            )));
        }
        let accepted = match option.split_once('=') {
            Some((key, value)) => {
                ALLOWED_KEYED.contains(&key)
                    && !value.is_empty()
                    && value
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            }
            None => ALLOWED_FLAGS.contains(&option),
        };
        if !accepted {
            return Err(DriverError::InvalidArgument(format!(
                "mount option {:?} is not in the whitelist",
                option
            )));
        }
        if !effective.iter().any(|o| o == option) {
            effective.push(option.to_string());
        }
    }

    for required in REQUIRED_OPTIONS {
        if !effective.iter().any(|o| o == required) {
            effective.push((*required).to_string());
        }
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_are_always_present() {
        let effective = build_mount_options(&[]).unwrap();
        assert_eq!(effective, opts(&["nosuid", "nodev", "noexec"]));
    }

    #[test]
    fn requested_options_come_first_without_duplicates() {
        let effective = build_mount_options(&opts(&["noatime", "nosuid"])).unwrap();
        assert_eq!(effective, opts(&["noatime", "nosuid", "nodev", "noexec"]));
    }

    #[test]
    fn dangerous_options_are_rejected() {
        for option in ["suid", "dev", "exec"] {
            let err = build_mount_options(&opts(&[option])).unwrap_err();
            assert!(matches!(err, DriverError::InvalidArgument(_)), "{}", option);
        }
    }

    #[test]
    fn unknown_and_malformed_options_are_rejected() {
        assert!(build_mount_options(&opts(&["remount"])).is_err());
        assert!(build_mount_options(&opts(&[""])).is_err());
        assert!(build_mount_options(&opts(&["data="])).is_err());
        assert!(build_mount_options(&opts(&["data=ordered,suid"])).is_err());
        assert!(build_mount_options(&opts(&["context=system_u"])).is_err());
        assert!(build_mount_options(&opts(&["ro,exec"])).is_err());
    }

    #[test]
    fn keyed_options_accept_simple_values() {
        let effective = build_mount_options(&opts(&["data=ordered", "commit=30"])).unwrap();
        assert!(effective.contains(&"data=ordered".to_string()));
        assert!(effective.contains(&"commit=30".to_string()));
    }
}
