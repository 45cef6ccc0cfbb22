//! Formatting, mounting, stale-mount detection, and recovery.
//!
//! A staged mount goes stale when the NVMe controller under it renumbers:
//! the mount table still names the old device node while the subsystem now
//! serves the namespace under a new one. Staleness is decided by real-path
//! comparison against the device the resolver currently reports, never by
//! string equality, so `/dev/disk/by-*` symlinks compare correctly.
//!
//! All kernel tools are executed as child processes; the mountinfo and proc
//! roots are configurable so tests can run against fixture trees.

pub mod mountinfo;
pub mod options;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::device::DeviceResolver;
use crate::error::DriverError;
use crate::metrics;
use mountinfo::{parse_mountinfo, MountEntry};
use options::{build_mount_options, REQUIRED_OPTIONS};

const UNMOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Why a mount was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The target is not a mount point at all.
    NotMounted,
    /// The mounted source device no longer exists.
    DeviceMissing,
    /// The mounted source resolves to a different device than the NQN does.
    DevicePathMismatch,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StaleReason::NotMounted => "not_mounted",
            StaleReason::DeviceMissing => "device_missing",
            StaleReason::DevicePathMismatch => "device_path_mismatch",
        };
        f.write_str(s)
    }
}

/// Tuning for unmount escalation and recovery retries.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// How long a busy unmount may take before escalation is considered.
    pub normal_unmount_wait: Duration,
    /// Recovery attempts before giving up.
    pub recovery_max_attempts: u32,
    /// Backoff before the second recovery attempt; doubles per attempt.
    pub recovery_initial_backoff: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            normal_unmount_wait: Duration::from_secs(10),
            recovery_max_attempts: 3,
            recovery_initial_backoff: Duration::from_secs(1),
        }
    }
}

/// The narrow mounter interface the Node service depends on.
/// [`MountManager`] is the production implementation; tests swap in
/// doubles.
#[async_trait::async_trait]
pub trait Mounter: Send + Sync {
    /// Creates a filesystem unless one is present.
    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), DriverError>;
    /// Mounts with whitelisted options.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError>;
    /// Bind-mounts a staged path into a pod target.
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
    ) -> Result<(), DriverError>;
    /// Unmounts; not-mounted is success.
    async fn unmount(&self, target: &Path) -> Result<(), DriverError>;
    /// Whether the target appears in the mount table.
    fn is_likely_mount_point(&self, target: &Path) -> Result<bool, DriverError>;
    /// Staleness verdict for the mount at `target` against `nqn`.
    async fn is_mount_stale(
        &self,
        target: &Path,
        nqn: &str,
    ) -> Result<Option<StaleReason>, DriverError>;
    /// Replaces a stale mount.
    async fn recover_mount(
        &self,
        target: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError>;
    /// Grows the filesystem mounted at `target`.
    async fn expand_filesystem(&self, target: &Path) -> Result<(), DriverError>;
}

#[async_trait::async_trait]
impl Mounter for MountManager {
    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), DriverError> {
        MountManager::format(self, device, fs_type).await
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        MountManager::mount(self, source, target, fs_type, options).await
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
    ) -> Result<(), DriverError> {
        MountManager::bind_mount(self, source, target, readonly).await
    }

    async fn unmount(&self, target: &Path) -> Result<(), DriverError> {
        MountManager::unmount(self, target).await
    }

    fn is_likely_mount_point(&self, target: &Path) -> Result<bool, DriverError> {
        MountManager::is_likely_mount_point(self, target)
    }

    async fn is_mount_stale(
        &self,
        target: &Path,
        nqn: &str,
    ) -> Result<Option<StaleReason>, DriverError> {
        MountManager::is_mount_stale(self, target, nqn).await
    }

    async fn recover_mount(
        &self,
        target: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        MountManager::recover_mount(self, target, nqn, fs_type, options).await
    }

    async fn expand_filesystem(&self, target: &Path) -> Result<(), DriverError> {
        MountManager::expand_filesystem(self, target).await
    }
}

/// Formats, mounts, and repairs block-device mounts.
pub struct MountManager {
    resolver: Arc<DeviceResolver>,
    config: MountConfig,
    mountinfo_path: PathBuf,
    proc_root: PathBuf,
    // Tests point this at a directory of stub tools; None means $PATH.
    tool_dir: Option<PathBuf>,
    // Recovery for a target must not race another recovery of the same
    // target; locks are created on demand and never dropped while held.
    target_locks: tokio::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl MountManager {
    /// A manager over the real mount table and /proc.
    pub fn new(resolver: Arc<DeviceResolver>, config: MountConfig) -> Self {
        Self::with_roots(resolver, config, "/proc/self/mountinfo", "/proc")
    }

    /// Same, over fixture paths. Tests use this.
    pub fn with_roots(
        resolver: Arc<DeviceResolver>,
        config: MountConfig,
        mountinfo_path: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        MountManager {
            resolver,
            config,
            mountinfo_path: mountinfo_path.into(),
            proc_root: proc_root.into(),
            tool_dir: None,
            target_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_tool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_dir = Some(dir.into());
        self
    }

    async fn run_tool(&self, tool: &str, args: &[&str]) -> Result<std::process::Output, DriverError> {
        let program = match &self.tool_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        };
        match tokio::process::Command::new(&program).args(args).output().await {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DriverError::Internal(format!(
                    "{} not found; it must be installed on the node",
                    tool
                )))
            }
            Err(e) => Err(DriverError::Internal(format!(
                "running {} {:?} failed: {}",
                tool, args, e
            ))),
        }
    }

    fn mount_entries(&self) -> Result<Vec<MountEntry>, DriverError> {
        let content = std::fs::read_to_string(&self.mountinfo_path).map_err(|e| {
            DriverError::Internal(format!(
                "reading {} failed: {}",
                self.mountinfo_path.display(),
                e
            ))
        })?;
        Ok(parse_mountinfo(&content))
    }

    /// The mount entry whose mount point equals `target`, if any. The last
    /// matching entry wins, so an over-mount shadows what it covers.
    pub fn get_mount_entry(&self, target: &Path) -> Result<Option<MountEntry>, DriverError> {
        Ok(self
            .mount_entries()?
            .into_iter()
            .filter(|e| e.mount_point == target)
            .last())
    }

    /// Whether `target` appears in the mount table.
    pub fn is_likely_mount_point(&self, target: &Path) -> Result<bool, DriverError> {
        Ok(self.get_mount_entry(target)?.is_some())
    }

    /// The source device of the mount at `target`.
    pub fn get_mount_device(&self, target: &Path) -> Result<PathBuf, DriverError> {
        self.get_mount_entry(target)?
            .map(|e| e.source)
            .ok_or_else(|| {
                DriverError::NotFound(format!("{} is not a mount point", target.display()))
            })
    }

    /// Creates a filesystem on `device` unless one is already present.
    /// A device carrying a different filesystem than requested is refused.
    #[instrument(level = "info", skip(self), fields(device = %device.display()))]
    pub async fn format(&self, device: &Path, fs_type: &str) -> Result<(), DriverError> {
        let mkfs = match fs_type {
            "ext3" | "ext4" => format!("mkfs.{}", fs_type),
            "xfs" => "mkfs.xfs".to_string(),
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported filesystem type {:?}",
                    other
                )))
            }
        };

        if let Some(existing) = self.probe_filesystem(device).await? {
            if existing != fs_type {
                return Err(DriverError::FailedPrecondition(format!(
                    "device {} already carries a {} filesystem, refusing to format as {}",
                    device.display(),
                    existing,
                    fs_type
                )));
            }
            debug!(fs_type, "device already formatted, skipping mkfs");
            return Ok(());
        }

        let device_str = path_str(device)?;
        let args: Vec<&str> = if fs_type.starts_with("ext") {
            vec!["-F", device_str]
        } else {
            vec![device_str]
        };
        let output = self.run_tool(&mkfs, &args).await?;
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "{} on {} failed: {}",
                mkfs,
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(fs_type, "device formatted");
        Ok(())
    }

    // blkid exits non-zero with empty output when the device has no
    // recognizable filesystem.
    async fn probe_filesystem(&self, device: &Path) -> Result<Option<String>, DriverError> {
        let output = self.run_tool("blkid", &["-o", "value", "-s", "TYPE", path_str(device)?]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !stdout.is_empty() {
            return Ok(Some(stdout));
        }
        Ok(None)
    }

    /// Mounts `source` at `target` with whitelisted options. The effective
    /// option set always includes `nosuid,nodev,noexec`.
    #[instrument(level = "info", skip(self, options), fields(source = %source.display(), target = %target.display()))]
    pub async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        let effective = build_mount_options(options)?;
        tokio::fs::create_dir_all(target).await.map_err(|e| {
            DriverError::Internal(format!(
                "creating mount point {} failed: {}",
                target.display(),
                e
            ))
        })?;

        let output = self.run_tool(
            "mount",
            &[
                "-t",
                fs_type,
                "-o",
                &effective.join(","),
                path_str(source)?,
                path_str(target)?,
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "mounting {} at {} failed: {}",
                source.display(),
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(options = %effective.join(","), "mounted");
        Ok(())
    }

    /// Bind-mounts `source` at `target`, re-applying the required options
    /// (and `ro` when asked); a plain bind ignores mount options.
    #[instrument(level = "info", skip(self), fields(source = %source.display(), target = %target.display()))]
    pub async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
    ) -> Result<(), DriverError> {
        tokio::fs::create_dir_all(target).await.map_err(|e| {
            DriverError::Internal(format!(
                "creating bind target {} failed: {}",
                target.display(),
                e
            ))
        })?;

        let output = self.run_tool("mount", &["--bind", path_str(source)?, path_str(target)?]).await?;
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "bind mount {} -> {} failed: {}",
                source.display(),
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut remount = vec!["remount".to_string(), "bind".to_string()];
        remount.extend(REQUIRED_OPTIONS.iter().map(|o| o.to_string()));
        if readonly {
            remount.push("ro".to_string());
        }
        let output = self.run_tool("mount", &["-o", &remount.join(","), path_str(target)?]).await?;
        if !output.status.success() {
            // Roll the bind back; a publish without the option floor must
            // not survive.
            let _ = self.run_tool("umount", &[path_str(target)?]).await;
            return Err(DriverError::Internal(format!(
                "remounting bind at {} with restricted options failed: {}",
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Unmounts `target`. Unmounting something that is not mounted is
    /// success.
    #[instrument(level = "info", skip(self), fields(target = %target.display()))]
    pub async fn unmount(&self, target: &Path) -> Result<(), DriverError> {
        if !self.is_likely_mount_point(target)? {
            debug!("not a mount point, nothing to unmount");
            return Ok(());
        }
        let output = self.run_tool("umount", &[path_str(target)?]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") || stderr.contains("not a mount point") {
                return Ok(());
            }
            return Err(DriverError::Internal(format!(
                "unmounting {} failed: {}",
                target.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Unmounts `target`, waiting out a busy mount and escalating to a lazy
    /// unmount only when nothing holds files open underneath. A mount that
    /// is actively in use is refused rather than ripped out.
    #[instrument(level = "info", skip(self), fields(target = %target.display()))]
    pub async fn force_unmount(&self, target: &Path) -> Result<(), DriverError> {
        if !self.is_likely_mount_point(target)? {
            return Ok(());
        }

        let output = self.run_tool("umount", &[path_str(target)?]).await?;
        if output.status.success() && !self.is_likely_mount_point(target)? {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.normal_unmount_wait;
        while Instant::now() < deadline {
            tokio::time::sleep(UNMOUNT_POLL_INTERVAL).await;
            if !self.is_likely_mount_point(target)? {
                return Ok(());
            }
        }

        let (in_use, pids) = self.is_mount_in_use(target);
        if in_use {
            return Err(DriverError::FailedPrecondition(format!(
                "refusing to force-unmount {}: in use by pids {:?}",
                target.display(),
                pids
            )));
        }

        warn!("escalating to lazy unmount");
        let output = self.run_tool("umount", &["-l", path_str(target)?]).await?;
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "lazy unmount of {} failed: {}",
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Scans `/proc/*/fd` for open files under `target`. Advisory: entries
    /// that vanish mid-scan or deny access are skipped, and the answer can
    /// be outdated by the time it is used. It still blocks the clearly
    /// in-use cases.
    pub fn is_mount_in_use(&self, target: &Path) -> (bool, Vec<i32>) {
        let canonical = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
        let mut pids = Vec::new();

        let entries = match std::fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(_) => return (false, pids),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let pid: i32 = match name.to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            let fd_dir = entry.path().join("fd");
            let fds = match std::fs::read_dir(&fd_dir) {
                Ok(fds) => fds,
                // Permission denied or the process exited; skip.
                Err(_) => continue,
            };
            for fd in fds.flatten() {
                if let Ok(resolved) = std::fs::read_link(fd.path()) {
                    if resolved == canonical || resolved.starts_with(&canonical) {
                        pids.push(pid);
                        break;
                    }
                }
            }
        }
        (!pids.is_empty(), pids)
    }

    /// Decides whether the mount at `target` still serves the device the
    /// NQN resolves to. `Ok(None)` means healthy.
    pub async fn is_mount_stale(
        &self,
        target: &Path,
        nqn: &str,
    ) -> Result<Option<StaleReason>, DriverError> {
        let entry = match self.get_mount_entry(target)? {
            None => return Ok(Some(StaleReason::NotMounted)),
            Some(entry) => entry,
        };
        if !entry.source.exists() {
            return Ok(Some(StaleReason::DeviceMissing));
        }
        let current = self.resolver.resolve(nqn).await?;
        let mounted = std::fs::canonicalize(&entry.source).unwrap_or(entry.source);
        let resolved = std::fs::canonicalize(&current).unwrap_or(current);
        if mounted != resolved {
            return Ok(Some(StaleReason::DevicePathMismatch));
        }
        Ok(None)
    }

    /// Replaces a stale mount: force-unmount, re-resolve the device, mount
    /// again. Serialized per target; retried with exponential backoff up to
    /// the configured attempt count.
    #[instrument(level = "info", skip(self, options), fields(target = %target.display(), nqn))]
    pub async fn recover_mount(
        &self,
        target: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        let lock = self.target_lock(target).await;
        let _guard = lock.lock().await;

        let mut delay = self.config.recovery_initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_recover(target, nqn, fs_type, options).await {
                Ok(()) => {
                    metrics::MOUNT_RECOVERY_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    info!(attempt, "mount recovered");
                    return Ok(());
                }
                Err(e) if attempt < self.config.recovery_max_attempts.max(1) => {
                    warn!(attempt, error = %e, "mount recovery attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    metrics::MOUNT_RECOVERY_TOTAL
                        .with_label_values(&["failure"])
                        .inc();
                    return Err(e);
                }
            }
        }
    }

    async fn try_recover(
        &self,
        target: &Path,
        nqn: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        self.force_unmount(target).await?;
        self.resolver.invalidate(nqn).await;
        let device = self.resolver.resolve(nqn).await?;
        self.mount(&device, target, fs_type, options).await
    }

    /// Grows the filesystem mounted at `target` to its device's new size.
    /// ext filesystems grow through the device node, xfs through the mount
    /// point.
    #[instrument(level = "info", skip(self), fields(target = %target.display()))]
    pub async fn expand_filesystem(&self, target: &Path) -> Result<(), DriverError> {
        let entry = self.get_mount_entry(target)?.ok_or_else(|| {
            DriverError::NotFound(format!("{} is not a mount point", target.display()))
        })?;

        let output = match entry.fs_type.as_str() {
            "ext3" | "ext4" => self.run_tool("resize2fs", &[path_str(&entry.source)?]).await?,
            "xfs" => self.run_tool("xfs_growfs", &[path_str(target)?]).await?,
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "cannot grow unsupported filesystem {:?}",
                    other
                )))
            }
        };
        if !output.status.success() {
            return Err(DriverError::Internal(format!(
                "growing filesystem at {} failed: {}",
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn target_lock(&self, target: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.target_locks.lock().await;
        locks
            .entry(target.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn path_str(path: &Path) -> Result<&str, DriverError> {
    path.to_str().ok_or_else(|| {
        DriverError::InvalidArgument(format!("path {} is not valid UTF-8", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NQN: &str = "nqn.2000-02.com.mikrotik:pvc-1a";

    struct Fixture {
        dir: tempfile::TempDir,
        resolver: Arc<DeviceResolver>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            for sub in ["class/nvme", "class/block", "dev", "proc"] {
                std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            let resolver = Arc::new(DeviceResolver::with_roots(
                dir.path().join("class/nvme"),
                dir.path().join("class/block"),
                dir.path().join("dev"),
                Duration::from_millis(0),
            ));
            Fixture { dir, resolver }
        }

        fn add_device(&self, controller: &str, node: &str, nqn: &str) {
            let ctrl = self.dir.path().join("class/nvme").join(controller);
            std::fs::create_dir_all(ctrl.join(node)).unwrap();
            std::fs::write(ctrl.join("subsysnqn"), format!("{}\n", nqn)).unwrap();
            std::fs::write(self.dir.path().join("dev").join(node), b"").unwrap();
        }

        fn write_mountinfo(&self, entries: &[(&str, &str)]) -> PathBuf {
            let path = self.dir.path().join("mountinfo");
            let mut content = String::new();
            for (i, (source, mount_point)) in entries.iter().enumerate() {
                content.push_str(&format!(
                    "{} 25 259:3 / {} rw,nosuid,nodev,noexec shared:1 - ext4 {} rw\n",
                    600 + i,
                    mount_point,
                    source
                ));
            }
            std::fs::write(&path, content).unwrap();
            path
        }

        fn manager(&self, mountinfo: PathBuf) -> MountManager {
            MountManager::with_roots(
                self.resolver.clone(),
                MountConfig {
                    normal_unmount_wait: Duration::from_millis(50),
                    recovery_max_attempts: 2,
                    recovery_initial_backoff: Duration::from_millis(10),
                },
                mountinfo,
                self.dir.path().join("proc"),
            )
        }
    }

    #[tokio::test]
    async fn mount_device_lookup() {
        let f = Fixture::new();
        let dev = f.dir.path().join("dev/nvme0n1");
        let dev_str = dev.to_str().unwrap().to_string();
        let mountinfo = f.write_mountinfo(&[(&dev_str, "/var/lib/kubelet/staging")]);
        let m = f.manager(mountinfo);

        assert!(m
            .is_likely_mount_point(Path::new("/var/lib/kubelet/staging"))
            .unwrap());
        assert_eq!(
            m.get_mount_device(Path::new("/var/lib/kubelet/staging"))
                .unwrap(),
            dev
        );
        assert!(matches!(
            m.get_mount_device(Path::new("/not/mounted")),
            Err(DriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_when_not_mounted() {
        let f = Fixture::new();
        let mountinfo = f.write_mountinfo(&[]);
        let m = f.manager(mountinfo);
        assert_eq!(
            m.is_mount_stale(Path::new("/staging"), NQN).await.unwrap(),
            Some(StaleReason::NotMounted)
        );
    }

    #[tokio::test]
    async fn stale_when_device_vanished() {
        let f = Fixture::new();
        let gone = f.dir.path().join("dev/nvme9n9");
        let mountinfo = f.write_mountinfo(&[(gone.to_str().unwrap(), "/staging")]);
        let m = f.manager(mountinfo);
        assert_eq!(
            m.is_mount_stale(Path::new("/staging"), NQN).await.unwrap(),
            Some(StaleReason::DeviceMissing)
        );
    }

    #[tokio::test]
    async fn stale_on_controller_renumbering() {
        let f = Fixture::new();
        // The mount still points at nvme0n1, but the subsystem now serves
        // the namespace as nvme1n1.
        f.add_device("nvme1", "nvme1n1", NQN);
        let old = f.dir.path().join("dev/nvme0n1");
        std::fs::write(&old, b"").unwrap();
        let mountinfo = f.write_mountinfo(&[(old.to_str().unwrap(), "/staging")]);
        let m = f.manager(mountinfo);

        assert_eq!(
            m.is_mount_stale(Path::new("/staging"), NQN).await.unwrap(),
            Some(StaleReason::DevicePathMismatch)
        );
    }

    #[tokio::test]
    async fn healthy_mount_is_not_stale() {
        let f = Fixture::new();
        f.add_device("nvme0", "nvme0n1", NQN);
        let dev = f.dir.path().join("dev/nvme0n1");
        let mountinfo = f.write_mountinfo(&[(dev.to_str().unwrap(), "/staging")]);
        let m = f.manager(mountinfo);

        assert_eq!(m.is_mount_stale(Path::new("/staging"), NQN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_use_scan_reports_holding_pids() {
        let f = Fixture::new();
        let held = f.dir.path().join("data");
        std::fs::create_dir_all(held.join("sub")).unwrap();
        std::fs::write(held.join("sub/file"), b"x").unwrap();

        // pid 41 holds a file under the target, pid 42 holds elsewhere,
        // "self" is not a pid and is skipped.
        let proc = f.dir.path().join("proc");
        std::fs::create_dir_all(proc.join("41/fd")).unwrap();
        std::os::unix::fs::symlink(held.join("sub/file"), proc.join("41/fd/3")).unwrap();
        std::fs::create_dir_all(proc.join("42/fd")).unwrap();
        std::os::unix::fs::symlink("/somewhere/else", proc.join("42/fd/3")).unwrap();
        std::fs::create_dir_all(proc.join("self/fd")).unwrap();

        let mountinfo = f.write_mountinfo(&[]);
        let m = f.manager(mountinfo);
        let (in_use, pids) = m.is_mount_in_use(&held);
        assert!(in_use);
        assert_eq!(pids, vec![41]);

        let (in_use, pids) = m.is_mount_in_use(&held.join("sub/other"));
        assert!(!in_use);
        assert!(pids.is_empty());
    }

    #[tokio::test]
    async fn unmount_of_unmounted_target_is_success() {
        let f = Fixture::new();
        let mountinfo = f.write_mountinfo(&[]);
        let m = f.manager(mountinfo);
        m.unmount(Path::new("/nothing/here")).await.unwrap();
        m.force_unmount(Path::new("/nothing/here")).await.unwrap();
    }

    fn write_stub(dir: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn force_unmount_refuses_while_files_are_held_open() {
        let f = Fixture::new();
        let tools = f.dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        // umount always reports busy.
        write_stub(&tools, "umount", "#!/bin/sh\nexit 32\n");

        let target = f.dir.path().join("staging");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("data"), b"x").unwrap();
        let proc = f.dir.path().join("proc");
        std::fs::create_dir_all(proc.join("77/fd")).unwrap();
        std::os::unix::fs::symlink(target.join("data"), proc.join("77/fd/5")).unwrap();

        let mountinfo = f.write_mountinfo(&[("/dev/nvme0n1", target.to_str().unwrap())]);
        let m = f.manager(mountinfo).with_tool_dir(&tools);

        let err = m.force_unmount(&target).await.unwrap_err();
        match err {
            DriverError::FailedPrecondition(message) => {
                assert!(message.contains("77"), "{}", message)
            }
            other => panic!("expected FailedPrecondition, got {:?}", other),
        }
        // The mount remains.
        assert!(m.is_likely_mount_point(&target).unwrap());
    }

    #[tokio::test]
    async fn force_unmount_escalates_to_lazy_when_nothing_holds_it() {
        let f = Fixture::new();
        let tools = f.dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        // Plain umount stays busy, lazy succeeds.
        write_stub(
            &tools,
            "umount",
            "#!/bin/sh\nif [ \"$1\" = \"-l\" ]; then exit 0; fi\nexit 32\n",
        );

        let target = f.dir.path().join("staging");
        std::fs::create_dir_all(&target).unwrap();
        let mountinfo = f.write_mountinfo(&[("/dev/nvme0n1", target.to_str().unwrap())]);
        let m = f.manager(mountinfo).with_tool_dir(&tools);

        m.force_unmount(&target).await.unwrap();
    }

    #[tokio::test]
    async fn mount_rejects_denied_options_before_any_syscall() {
        let f = Fixture::new();
        let mountinfo = f.write_mountinfo(&[]);
        let m = f.manager(mountinfo);
        let err = m
            .mount(
                Path::new("/dev/null"),
                Path::new("/tmp/never-mounted"),
                "ext4",
                &["suid".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn format_rejects_unknown_filesystems() {
        let f = Fixture::new();
        let mountinfo = f.write_mountinfo(&[]);
        let m = f.manager(mountinfo);
        let err = m
            .format(Path::new("/dev/null"), "vfat9")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }
}
