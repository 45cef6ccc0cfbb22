//! Control-plane client for a RouterOS-based data server (RDS).
//!
//! The appliance exposes file-backed disks as NVMe/TCP namespaces and is
//! managed over SSH with structured CLI commands (`/disk add`,
//! `/disk remove`, `/disk print detail`, `/file ...`). This crate owns the
//! transport (a bounded session pool), command composition from validated
//! inputs, parsing of the appliance's `key="value"` output with its quirks,
//! and classification of failures into a small taxonomy the CSI layer maps
//! onto status codes.
//!
//! The client never interprets storage semantics; it moves validated
//! requests to the appliance and typed results back.

#![deny(missing_docs)]

mod client;
mod command;
mod error;
mod parser;
mod pool;
pub mod validate;

pub use client::{Capacity, RdsClient, RdsConfig, SnapshotInfo, VolumeInfo};
pub use command::CreateVolumeOptions;
pub use error::{classify_failure, failure_message, Error, ErrorKind};
pub use parser::{parse_detail, Record};
pub use pool::SshConfig;
