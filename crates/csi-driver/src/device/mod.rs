//! Resolution of NVMe block device paths by NQN.
//!
//! Controller indices on a node are not stable across reconnections, so a
//! device path must never be remembered beyond a short TTL. The resolver
//! scans sysfs (`/sys/class/nvme/*/subsysnqn`) for the controller serving a
//! subsystem and picks its block device, preferring the plain `nvmeXnY`
//! name over the multipath-style `nvmeXcYnZ` one. Results are cached per
//! NQN and served only while the TTL holds and the device node still
//! exists.
//!
//! The resolver can also recognize an orphaned subsystem: the kernel lists
//! the NQN as connected but no block device exists. Connectivity is
//! reported by a probe the NVMe connector installs after construction,
//! which is what breaks the connector-resolver reference cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::error::DriverError;

lazy_static! {
    static ref SIMPLE_NODE_RE: Regex = Regex::new(r"^nvme\d+n\d+$").unwrap();
    static ref COMPOSITE_NODE_RE: Regex = Regex::new(r"^nvme(\d+)c\d+n(\d+)$").unwrap();
    static ref CONTROLLER_RE: Regex = Regex::new(r"^nvme\d+$").unwrap();
}

/// Reports whether the kernel currently lists a subsystem as connected.
/// Implemented by the NVMe connector and installed with
/// [`DeviceResolver::install_probe`].
#[async_trait]
pub trait SubsystemProbe: Send + Sync {
    /// Whether `nqn` appears in the kernel's subsystem list.
    async fn is_subsystem_connected(&self, nqn: &str) -> Result<bool, DriverError>;
}

struct CacheEntry {
    path: PathBuf,
    resolved_at: Instant,
}

/// Maps NQNs to current block device paths.
pub struct DeviceResolver {
    sysfs_nvme_root: PathBuf,
    sysfs_block_root: PathBuf,
    dev_root: PathBuf,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
    probe: std::sync::RwLock<Option<Weak<dyn SubsystemProbe>>>,
}

impl DeviceResolver {
    /// A resolver over the real sysfs and /dev.
    pub fn new(ttl: Duration) -> Self {
        Self::with_roots("/sys/class/nvme", "/sys/class/block", "/dev", ttl)
    }

    /// A resolver over arbitrary roots. Tests point this at a tempdir tree.
    pub fn with_roots(
        sysfs_nvme_root: impl Into<PathBuf>,
        sysfs_block_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        DeviceResolver {
            sysfs_nvme_root: sysfs_nvme_root.into(),
            sysfs_block_root: sysfs_block_root.into(),
            dev_root: dev_root.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
            probe: std::sync::RwLock::new(None),
        }
    }

    /// Installs the connectivity probe. Called once by the connector after
    /// both halves exist.
    pub fn install_probe(&self, probe: Weak<dyn SubsystemProbe>) {
        *self.probe.write().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    /// Returns the current device path for `nqn`, from cache when the entry
    /// is unexpired and the device node still exists, otherwise by a fresh
    /// sysfs scan.
    pub async fn resolve(&self, nqn: &str) -> Result<PathBuf, DriverError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(nqn) {
                if entry.resolved_at.elapsed() < self.ttl && entry.path.exists() {
                    trace!(nqn, path = %entry.path.display(), "device cache hit");
                    return Ok(entry.path.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed the entry while we upgraded.
        if let Some(entry) = cache.get(nqn) {
            if entry.resolved_at.elapsed() < self.ttl && entry.path.exists() {
                return Ok(entry.path.clone());
            }
        }

        match self.scan(nqn)? {
            Some(name) => {
                let path = self.dev_root.join(&name);
                if !path.exists() {
                    cache.remove(nqn);
                    return Err(DriverError::NotFound(format!(
                        "block device {} for {} not present in {}",
                        name,
                        nqn,
                        self.dev_root.display()
                    )));
                }
                debug!(nqn, path = %path.display(), "resolved device by sysfs scan");
                cache.insert(
                    nqn.to_string(),
                    CacheEntry {
                        path: path.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                Ok(path)
            }
            None => {
                cache.remove(nqn);
                Err(DriverError::NotFound(format!(
                    "no block device found for subsystem {}",
                    nqn
                )))
            }
        }
    }

    /// Drops the cache entry for one NQN.
    pub async fn invalidate(&self, nqn: &str) {
        self.cache.write().await.remove(nqn);
    }

    /// Drops every cache entry.
    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    /// True when the kernel lists `nqn` as connected but the sysfs scan
    /// yields no block device. This is the signature of a controller that
    /// failed silently and needs a disconnect/reconnect cycle.
    pub async fn is_orphaned_subsystem(&self, nqn: &str) -> Result<bool, DriverError> {
        let probe = {
            let guard = self.probe.read().unwrap_or_else(|e| e.into_inner());
            guard.as_ref().and_then(Weak::upgrade)
        };
        let probe = probe.ok_or_else(|| {
            DriverError::Internal("connectivity probe not installed on resolver".into())
        })?;

        if !probe.is_subsystem_connected(nqn).await? {
            return Ok(false);
        }
        let orphaned = self.scan(nqn)?.is_none();
        if orphaned {
            warn!(nqn, "subsystem connected at kernel level but exposes no device");
        }
        Ok(orphaned)
    }

    // Walks the controllers, matches subsysnqn, and picks a block device
    // name for the matching controller.
    fn scan(&self, nqn: &str) -> Result<Option<String>, DriverError> {
        let controllers = match std::fs::read_dir(&self.sysfs_nvme_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DriverError::Internal(format!(
                    "reading {} failed: {}",
                    self.sysfs_nvme_root.display(),
                    e
                )))
            }
        };

        for entry in controllers.flatten() {
            let controller = entry.file_name().to_string_lossy().into_owned();
            if !CONTROLLER_RE.is_match(&controller) {
                continue;
            }
            let subsysnqn = entry.path().join("subsysnqn");
            let found = match std::fs::read_to_string(&subsysnqn) {
                Ok(contents) => contents.trim() == nqn,
                Err(_) => false,
            };
            if !found {
                continue;
            }

            let mut candidates = block_children(&entry.path(), &controller);
            if candidates.is_empty() {
                candidates = self.block_class_fallback(&controller);
            }
            return Ok(self.choose_candidate(candidates));
        }
        Ok(None)
    }

    // Children of the controller directory that look like block device
    // nodes of this controller.
    fn block_class_fallback(&self, controller: &str) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.sysfs_block_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| belongs_to_controller(name, controller))
            .collect()
    }

    // Applies the naming preference: any plain nvmeXnY candidate wins; a
    // composite nvmeXcYnZ maps to nvmeXnZ when that node exists in /dev.
    fn choose_candidate(&self, mut candidates: Vec<String>) -> Option<String> {
        candidates.sort();
        if let Some(simple) = candidates.iter().find(|c| SIMPLE_NODE_RE.is_match(c)) {
            return Some(simple.clone());
        }
        let composite = candidates
            .iter()
            .find(|c| COMPOSITE_NODE_RE.is_match(c))?;
        if let Some(caps) = COMPOSITE_NODE_RE.captures(composite) {
            let preferred = format!("nvme{}n{}", &caps[1], &caps[2]);
            if self.dev_root.join(&preferred).exists() {
                return Some(preferred);
            }
        }
        Some(composite.clone())
    }
}

fn block_children(controller_dir: &Path, controller: &str) -> Vec<String> {
    let entries = match std::fs::read_dir(controller_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| belongs_to_controller(name, controller))
        .collect()
}

fn belongs_to_controller(name: &str, controller: &str) -> bool {
    if SIMPLE_NODE_RE.is_match(name) {
        return name.starts_with(&format!("{}n", controller));
    }
    if COMPOSITE_NODE_RE.is_match(name) {
        return name
            .split('c')
            .next()
            .map_or(false, |prefix| prefix == controller);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const NQN: &str = "nqn.2000-02.com.mikrotik:pvc-1a";

    struct Tree {
        _dir: tempfile::TempDir,
        nvme: PathBuf,
        block: PathBuf,
        dev: PathBuf,
    }

    fn tree() -> Tree {
        let dir = tempfile::tempdir().unwrap();
        let nvme = dir.path().join("class/nvme");
        let block = dir.path().join("class/block");
        let dev = dir.path().join("dev");
        std::fs::create_dir_all(&nvme).unwrap();
        std::fs::create_dir_all(&block).unwrap();
        std::fs::create_dir_all(&dev).unwrap();
        Tree {
            _dir: dir,
            nvme,
            block,
            dev,
        }
    }

    fn add_controller(tree: &Tree, name: &str, nqn: &str, children: &[&str]) {
        let dir = tree.nvme.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("subsysnqn"), format!("{}\n", nqn)).unwrap();
        for child in children {
            std::fs::create_dir_all(dir.join(child)).unwrap();
        }
    }

    fn add_dev(tree: &Tree, name: &str) {
        std::fs::write(tree.dev.join(name), b"").unwrap();
    }

    fn resolver(tree: &Tree, ttl: Duration) -> DeviceResolver {
        DeviceResolver::with_roots(&tree.nvme, &tree.block, &tree.dev, ttl)
    }

    struct StaticProbe(AtomicBool);

    #[async_trait]
    impl SubsystemProbe for StaticProbe {
        async fn is_subsystem_connected(&self, _nqn: &str) -> Result<bool, DriverError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn resolves_simple_device_name() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &["nvme0n1"]);
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(10));
        let path = r.resolve(NQN).await.unwrap();
        assert_eq!(path, t.dev.join("nvme0n1"));
    }

    #[tokio::test]
    async fn prefers_simple_over_composite() {
        let t = tree();
        add_controller(&t, "nvme1", NQN, &["nvme1c1n2", "nvme1n2"]);
        add_dev(&t, "nvme1c1n2");
        add_dev(&t, "nvme1n2");

        let r = resolver(&t, Duration::from_secs(10));
        assert_eq!(r.resolve(NQN).await.unwrap(), t.dev.join("nvme1n2"));
    }

    #[tokio::test]
    async fn composite_maps_to_plain_node_when_it_exists() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &["nvme0c0n1"]);
        add_dev(&t, "nvme0c0n1");
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(10));
        assert_eq!(r.resolve(NQN).await.unwrap(), t.dev.join("nvme0n1"));
    }

    #[tokio::test]
    async fn composite_is_used_when_no_plain_node_exists() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &["nvme0c0n1"]);
        add_dev(&t, "nvme0c0n1");

        let r = resolver(&t, Duration::from_secs(10));
        assert_eq!(r.resolve(NQN).await.unwrap(), t.dev.join("nvme0c0n1"));
    }

    #[tokio::test]
    async fn falls_back_to_block_class() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &[]);
        std::fs::create_dir_all(t.block.join("nvme0n1")).unwrap();
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(10));
        assert_eq!(r.resolve(NQN).await.unwrap(), t.dev.join("nvme0n1"));
    }

    #[tokio::test]
    async fn other_subsystems_are_not_matched() {
        let t = tree();
        add_controller(&t, "nvme0", "nqn.2000-02.com.mikrotik:pvc-other", &["nvme0n1"]);
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(10));
        assert!(matches!(
            r.resolve(NQN).await,
            Err(DriverError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cache_hit_requires_device_presence() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &["nvme0n1"]);
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(60));
        assert!(r.resolve(NQN).await.is_ok());

        // Device disappears and the controller renumbers to nvme2.
        std::fs::remove_file(t.dev.join("nvme0n1")).unwrap();
        std::fs::remove_dir_all(t.nvme.join("nvme0")).unwrap();
        add_controller(&t, "nvme2", NQN, &["nvme2n1"]);
        add_dev(&t, "nvme2n1");

        // Unexpired entry, but the stale path no longer exists: rescan.
        assert_eq!(r.resolve(NQN).await.unwrap(), t.dev.join("nvme2n1"));
    }

    #[tokio::test]
    async fn invalidate_forces_rescan() {
        let t = tree();
        add_controller(&t, "nvme0", NQN, &["nvme0n1"]);
        add_dev(&t, "nvme0n1");

        let r = resolver(&t, Duration::from_secs(60));
        assert!(r.resolve(NQN).await.is_ok());
        r.invalidate(NQN).await;
        assert!(r.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn orphan_detection_needs_kernel_connection_and_no_device() {
        let t = tree();
        let r = Arc::new(resolver(&t, Duration::from_secs(10)));
        let probe: Arc<dyn SubsystemProbe> = Arc::new(StaticProbe(AtomicBool::new(true)));
        r.install_probe(Arc::downgrade(&probe));

        // Connected but no sysfs entry at all: orphaned.
        assert!(r.is_orphaned_subsystem(NQN).await.unwrap());

        // Device appears: no longer orphaned.
        add_controller(&t, "nvme0", NQN, &["nvme0n1"]);
        add_dev(&t, "nvme0n1");
        assert!(!r.is_orphaned_subsystem(NQN).await.unwrap());

        // Not connected: never orphaned, regardless of sysfs.
        std::fs::remove_dir_all(t.nvme.join("nvme0")).unwrap();
        let probe2: Arc<dyn SubsystemProbe> = Arc::new(StaticProbe(AtomicBool::new(false)));
        r.install_probe(Arc::downgrade(&probe2));
        assert!(!r.is_orphaned_subsystem(NQN).await.unwrap());
    }

    #[tokio::test]
    async fn missing_probe_is_an_error() {
        let t = tree();
        let r = resolver(&t, Duration::from_secs(10));
        assert!(r.is_orphaned_subsystem(NQN).await.is_err());
    }
}
