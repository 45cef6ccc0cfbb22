//! A CSI driver for RouterOS-based data servers (RDS) exposing file-backed
//! block volumes over NVMe/TCP.
//!
//! The driver provisions volumes on the appliance through the control-plane
//! client in the `rds-client` crate, connects them to worker nodes with
//! `nvme-cli`, formats and mounts them, and bind-mounts the staged
//! filesystem into pod target paths. The parts that carry the real
//! engineering weight live in their own modules:
//!
//! - [`device`]: NQN to device-path resolution over sysfs with a TTL'd
//!   cache, since controller indices are not stable across reconnections.
//! - [`mount`]: mount-option policy, mountinfo parsing, stale-mount
//!   detection by real-path comparison, and serialized recovery.
//! - [`attachment`]: the authoritative attachment table with per-volume
//!   locking, PV-annotation persistence, the detach grace period for live
//!   migration, and the deleted-node reconciler.
//! - [`services`]: the CSI Identity, Controller, and Node services over
//!   tonic, composed from the above.

pub mod appliance;
pub mod attachment;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod grpc_sock;
pub mod metrics;
pub mod mount;
pub mod nvme;
pub mod services;

/// The driver name announced through the Identity service and used as the
/// annotation and topology key prefix.
pub const DRIVER_NAME: &str = "csi.rds.mikrotik.com";

/// The driver version announced through the Identity service.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The NQN the appliance exports a volume under.
pub fn nqn_for_volume(volume_id: &str) -> String {
    format!("{}{}", rds_client::validate::NQN_PREFIX, volume_id)
}
