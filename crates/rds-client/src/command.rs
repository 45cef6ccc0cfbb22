//! Composition of appliance CLI commands from validated inputs.
//!
//! Every value interpolated here has already passed [`crate::validate`];
//! the composers only assemble known-safe strings.

use crate::validate::NQN_PREFIX;

/// Options for creating a file-backed, NVMe/TCP-exported disk.
#[derive(Debug, Clone)]
pub struct CreateVolumeOptions {
    /// Appliance slot, equal to the volume ID.
    pub slot: String,
    /// Backing file path, `<base>/<volumeID>.img`.
    pub file_path: String,
    /// Size of the backing file in bytes.
    pub size_bytes: u64,
    /// NVMe/TCP listener port for the export.
    pub nvme_port: u16,
}

impl CreateVolumeOptions {
    /// The NQN the export will be reachable under.
    pub fn nqn(&self) -> String {
        format!("{}{}", NQN_PREFIX, self.slot)
    }
}

pub(crate) fn disk_add(opts: &CreateVolumeOptions) -> String {
    format!(
        "/disk add type=file file-path={} file-size={} slot={} \
         nvme-tcp-export=yes nvme-tcp-server-port={} nvme-tcp-server-nqn=\"{}\"",
        opts.file_path,
        opts.size_bytes,
        opts.slot,
        opts.nvme_port,
        opts.nqn(),
    )
}

pub(crate) fn disk_remove(slot: &str) -> String {
    format!("/disk remove [find slot=\"{}\"]", slot)
}

pub(crate) fn disk_print_detail(slot: Option<&str>) -> String {
    match slot {
        Some(slot) => format!("/disk print detail where slot=\"{}\"", slot),
        None => "/disk print detail".to_string(),
    }
}

pub(crate) fn disk_resize(slot: &str, new_size: u64) -> String {
    format!("/disk set [find slot=\"{}\"] file-size={}", slot, new_size)
}

pub(crate) fn file_remove(path: &str) -> String {
    format!("/file remove {}", path)
}

pub(crate) fn file_copy(source: &str, destination: &str) -> String {
    format!(
        "/file copy source=\"{}\" destination=\"{}\"",
        source, destination
    )
}

pub(crate) fn file_print_detail(path: &str) -> String {
    format!("/file print detail where name=\"{}\"", path)
}
