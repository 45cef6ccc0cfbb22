//! NVMe/TCP connection management against the node's kernel.
//!
//! The connector shells out to `nvme-cli` for connect, disconnect, and the
//! subsystem listing, and leans on the [`DeviceResolver`] for device paths.
//! Connectivity is decided from `nvme list-subsys -o json` matched by NQN
//! content; matching on controller indices or device-path substrings breaks
//! as soon as a controller renumbers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::device::{DeviceResolver, SubsystemProbe};
use crate::error::DriverError;

/// Where a namespace is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeTarget {
    /// Subsystem NQN.
    pub nqn: String,
    /// Target IP address.
    pub address: String,
    /// NVMe/TCP port.
    pub port: u16,
}

/// The narrow connector interface the Node service depends on.
/// [`NvmeConnector`] is the production implementation; tests swap in
/// doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and returns the block device path.
    async fn connect(&self, target: &NvmeTarget) -> Result<PathBuf, DriverError>;
    /// Tears a subsystem down; absence is success.
    async fn disconnect(&self, nqn: &str) -> Result<(), DriverError>;
}

#[async_trait]
impl Connector for NvmeConnector {
    async fn connect(&self, target: &NvmeTarget) -> Result<PathBuf, DriverError> {
        NvmeConnector::connect(self, target).await
    }

    async fn disconnect(&self, nqn: &str) -> Result<(), DriverError> {
        NvmeConnector::disconnect(self, nqn).await
    }
}

/// Drives `nvme connect`/`nvme disconnect` and device-path resolution.
pub struct NvmeConnector {
    resolver: Arc<DeviceResolver>,
    connect_timeout: Duration,
    poll_interval: Duration,
    initial_delay: Duration,
    nvme_binary: PathBuf,
}

impl NvmeConnector {
    /// Creates the connector and installs its connectivity probe on the
    /// resolver.
    pub fn new(
        resolver: Arc<DeviceResolver>,
        connect_timeout: Duration,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Self::with_binary(resolver, connect_timeout, poll_interval, "nvme")
    }

    /// Same, with an explicit path to the `nvme` binary. Tests use this to
    /// point at a stub.
    pub fn with_binary(
        resolver: Arc<DeviceResolver>,
        connect_timeout: Duration,
        poll_interval: Duration,
        nvme_binary: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let connector = Arc::new(NvmeConnector {
            resolver,
            connect_timeout,
            poll_interval,
            initial_delay: Duration::from_millis(100),
            nvme_binary: nvme_binary.into(),
        });
        let probe: Arc<dyn SubsystemProbe> = connector.clone();
        connector.resolver.install_probe(Arc::downgrade(&probe));
        connector
    }

    /// The resolver this connector feeds.
    pub fn resolver(&self) -> &Arc<DeviceResolver> {
        &self.resolver
    }

    /// Connects to the target and waits for its block device to appear.
    ///
    /// A subsystem that is connected at the kernel level but exposes no
    /// device is torn down first; a connect attempt on top of such an
    /// orphan would otherwise report success and never produce a device.
    /// On any failure after the connect command, the connection is torn
    /// down again so no half-open state is left behind.
    #[instrument(level = "info", skip(self, target), fields(nqn = %target.nqn))]
    pub async fn connect(&self, target: &NvmeTarget) -> Result<PathBuf, DriverError> {
        if self.is_connected(&target.nqn).await?
            && self.resolver.is_orphaned_subsystem(&target.nqn).await?
        {
            warn!(nqn = %target.nqn, "recovering orphaned subsystem before connect");
            self.disconnect(&target.nqn).await?;
            self.resolver.invalidate(&target.nqn).await;
        }

        let port = target.port.to_string();
        let output = self
            .run_nvme(&[
                "connect",
                "-t",
                "tcp",
                "-a",
                &target.address,
                "-s",
                &port,
                "-n",
                &target.nqn,
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.to_lowercase().contains("already connected") {
                return Err(DriverError::Unavailable(format!(
                    "nvme connect to {} ({}:{}) failed: {}",
                    target.nqn,
                    target.address,
                    target.port,
                    stderr.trim()
                )));
            }
            debug!(nqn = %target.nqn, "target already connected");
        }

        match self.wait_for_device(&target.nqn, self.connect_timeout).await {
            Ok(path) => {
                info!(nqn = %target.nqn, device = %path.display(), "nvme target connected");
                Ok(path)
            }
            Err(e) => {
                // Tear the connection down rather than leave it half-open.
                if let Err(cleanup) = self.disconnect(&target.nqn).await {
                    warn!(nqn = %target.nqn, error = %cleanup, "teardown after failed connect also failed");
                }
                Err(e)
            }
        }
    }

    /// Disconnects a subsystem. Absence of the subsystem is success.
    #[instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, nqn: &str) -> Result<(), DriverError> {
        let output = self.run_nvme(&["disconnect", "-n", nqn]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if !(stderr.contains("not found")
                || stderr.contains("no controller")
                || stderr.contains("no subsystem"))
            {
                return Err(DriverError::Internal(format!(
                    "nvme disconnect of {} failed: {}",
                    nqn,
                    stderr.trim()
                )));
            }
        }
        self.resolver.invalidate(nqn).await;
        Ok(())
    }

    /// Whether the kernel lists `nqn` among the connected subsystems.
    pub async fn is_connected(&self, nqn: &str) -> Result<bool, DriverError> {
        let output = self.run_nvme(&["list-subsys", "-o", "json"]).await?;
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "nvme list-subsys failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(false);
        }
        let listed = parse_subsys_nqns(&stdout)?;
        Ok(listed.iter().any(|listed| listed == nqn))
    }

    /// The current device path for a connected subsystem.
    pub async fn device_path(&self, nqn: &str) -> Result<PathBuf, DriverError> {
        self.resolver.resolve(nqn).await
    }

    /// Polls the resolver until the device appears or `timeout` elapses.
    /// A short first delay covers the common case of the device showing up
    /// almost immediately; afterwards the configured interval applies.
    pub async fn wait_for_device(
        &self,
        nqn: &str,
        timeout: Duration,
    ) -> Result<PathBuf, DriverError> {
        let deadline = Instant::now() + timeout;
        tokio::time::sleep(self.initial_delay.min(timeout)).await;
        loop {
            match self.resolver.resolve(nqn).await {
                Ok(path) => return Ok(path),
                Err(DriverError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Unavailable(format!(
                    "block device for {} did not appear within {:?}",
                    nqn, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn run_nvme(&self, args: &[&str]) -> Result<std::process::Output, DriverError> {
        match tokio::process::Command::new(&self.nvme_binary)
            .args(args)
            .output()
            .await
        {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DriverError::Internal(
                format!(
                    "{} not found; nvme-cli must be installed on the node",
                    self.nvme_binary.display()
                ),
            )),
            Err(e) => Err(DriverError::Internal(format!(
                "running {} {:?} failed: {}",
                self.nvme_binary.display(),
                args,
                e
            ))),
        }
    }
}

#[async_trait]
impl SubsystemProbe for NvmeConnector {
    async fn is_subsystem_connected(&self, nqn: &str) -> Result<bool, DriverError> {
        self.is_connected(nqn).await
    }
}

// Collects every NQN from `nvme list-subsys -o json`, tolerating the layout
// differences between nvme-cli versions (top-level object vs. array of
// hosts, lower- vs. upper-case keys).
fn parse_subsys_nqns(json: &str) -> Result<Vec<String>, DriverError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        DriverError::Internal(format!("nvme list-subsys output is not valid JSON: {}", e))
    })?;
    let mut nqns = Vec::new();
    collect_nqns(&value, &mut nqns);
    Ok(nqns)
}

fn collect_nqns(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_nqns(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if key.eq_ignore_ascii_case("nqn") || key.eq_ignore_ascii_case("subsysnqn") {
                    if let Some(s) = value.as_str() {
                        out.push(s.to_string());
                        continue;
                    }
                }
                collect_nqns(value, out);
            }
        }
        _ => {}
    }
}
