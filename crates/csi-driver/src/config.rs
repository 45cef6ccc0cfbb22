//! Process-wide driver configuration, read once at startup. Construct a
//! [`Config`] in code, or with the `cli` feature enabled use
//! [`Config::new_from_flags`] to populate it from command line flags and
//! environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

/// The default NVMe/TCP port RouterOS exports namespaces on.
pub const DEFAULT_NVME_PORT: u16 = 4420;

/// The configuration needed to run the driver. Field groups follow the
/// subsystems they tune; every value has a default that works against a
/// stock appliance except the appliance credentials themselves.
#[derive(Clone, Debug)]
pub struct Config {
    /// gRPC bind: `unix:///path/csi.sock`, a bare socket path, or a TCP
    /// `host:port` address.
    pub endpoint: String,
    /// Name this node registers volumes under. Required in node mode.
    pub node_id: String,
    /// Whether the Controller service is registered.
    pub run_controller: bool,
    /// Whether the Node service is registered.
    pub run_node: bool,

    /// Appliance management address.
    pub rds_address: String,
    /// Appliance SSH port.
    pub rds_ssh_port: u16,
    /// Appliance SSH user.
    pub rds_user: String,
    /// Path to the SSH private key.
    pub rds_private_key: PathBuf,
    /// Path to the pinned appliance host public key.
    pub rds_host_key: Option<PathBuf>,
    /// Disable host key verification. Test deployments only.
    pub insecure_skip_host_key: bool,

    /// Appliance directory volume backing files live under.
    pub volume_base_path: String,
    /// NVMe/TCP port used for new exports.
    pub default_nvme_port: u16,

    /// How long a resolved device path may be served from cache.
    pub resolver_ttl: Duration,
    /// How long to wait for a block device after `nvme connect`.
    pub connect_timeout: Duration,
    /// Poll interval while waiting for the device to appear.
    pub device_poll_interval: Duration,

    /// How long a normal unmount may take before escalation is considered.
    pub normal_unmount_wait: Duration,
    /// Mount recovery attempts before giving up.
    pub recovery_max_attempts: u32,
    /// First backoff delay between recovery attempts.
    pub recovery_initial_backoff: Duration,

    /// Window after detach during which a cross-node attach is a
    /// live-migration handoff rather than a conflict.
    pub attachment_grace_period: Duration,
    /// Reconciler tick interval.
    pub reconcile_interval: Duration,
    /// Whether the attachment reconciler runs at all.
    pub reconciler_enabled: bool,
    /// Accept MULTI_NODE_MULTI_WRITER volumes (live-migration deployments).
    pub enable_multi_node_writer: bool,

    /// Optional bind address for Prometheus exposition.
    pub metrics_endpoint: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: "unix:///var/lib/kubelet/plugins/csi.rds.mikrotik.com/csi.sock".to_string(),
            node_id: String::new(),
            run_controller: false,
            run_node: false,
            rds_address: String::new(),
            rds_ssh_port: 22,
            rds_user: "admin".to_string(),
            rds_private_key: PathBuf::from("/etc/rds-csi/id_ed25519"),
            rds_host_key: None,
            insecure_skip_host_key: false,
            volume_base_path: "raid1/csi".to_string(),
            default_nvme_port: DEFAULT_NVME_PORT,
            resolver_ttl: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            device_poll_interval: Duration::from_millis(500),
            normal_unmount_wait: Duration::from_secs(10),
            recovery_max_attempts: 3,
            recovery_initial_backoff: Duration::from_secs(1),
            attachment_grace_period: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            reconciler_enabled: true,
            enable_multi_node_writer: false,
            metrics_endpoint: None,
        }
    }
}

impl Config {
    /// Parses all command line flags and environment variables into a
    /// config. The version of the enclosing binary is used for `--version`.
    #[cfg(feature = "cli")]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        let defaults = Config::default();
        Config {
            endpoint: opts.endpoint,
            node_id: opts.node_id.unwrap_or_default(),
            run_controller: opts.controller,
            run_node: opts.node,
            rds_address: opts.rds_address,
            rds_ssh_port: opts.rds_ssh_port,
            rds_user: opts.rds_user,
            rds_private_key: opts.rds_private_key.unwrap_or(defaults.rds_private_key),
            rds_host_key: opts.rds_host_key,
            insecure_skip_host_key: opts.insecure_skip_host_key,
            volume_base_path: opts.volume_base_path,
            default_nvme_port: opts.default_nvme_port,
            resolver_ttl: Duration::from_secs(opts.resolver_ttl_secs),
            connect_timeout: Duration::from_secs(opts.connect_timeout_secs),
            device_poll_interval: Duration::from_millis(opts.device_poll_interval_ms),
            normal_unmount_wait: Duration::from_secs(opts.normal_unmount_wait_secs),
            recovery_max_attempts: opts.recovery_max_attempts,
            recovery_initial_backoff: Duration::from_secs(opts.recovery_initial_backoff_secs),
            attachment_grace_period: Duration::from_secs(opts.attachment_grace_period_secs),
            reconcile_interval: Duration::from_secs(opts.reconcile_interval_secs),
            reconciler_enabled: !opts.disable_reconciler,
            enable_multi_node_writer: opts.enable_multi_node_writer,
            metrics_endpoint: opts.metrics_endpoint,
        }
    }
}

// Opts contains the flags the driver binary accepts.
#[cfg(feature = "cli")]
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "rds-csi",
    about = "A CSI driver for RouterOS-based data servers over NVMe/TCP"
)]
pub struct Opts {
    #[structopt(
        long = "endpoint",
        env = "CSI_ENDPOINT",
        default_value = "unix:///var/lib/kubelet/plugins/csi.rds.mikrotik.com/csi.sock",
        help = "The gRPC endpoint to serve on (unix socket path or TCP address)"
    )]
    endpoint: String,

    #[structopt(long = "controller", help = "Register the Controller service")]
    controller: bool,

    #[structopt(long = "node", help = "Register the Node service")]
    node: bool,

    #[structopt(
        long = "node-id",
        env = "KUBE_NODE_NAME",
        help = "The Kubernetes node name, required with --node"
    )]
    node_id: Option<String>,

    #[structopt(
        long = "rds-address",
        env = "RDS_ADDRESS",
        default_value = "",
        help = "Management address of the data server"
    )]
    rds_address: String,

    #[structopt(
        long = "rds-ssh-port",
        env = "RDS_SSH_PORT",
        default_value = "22",
        help = "SSH port of the data server"
    )]
    rds_ssh_port: u16,

    #[structopt(
        long = "rds-user",
        env = "RDS_USER",
        default_value = "admin",
        help = "SSH user on the data server"
    )]
    rds_user: String,

    #[structopt(
        long = "rds-private-key",
        env = "RDS_PRIVATE_KEY",
        help = "Path to the SSH private key. Defaults to /etc/rds-csi/id_ed25519"
    )]
    rds_private_key: Option<PathBuf>,

    #[structopt(
        long = "rds-host-key",
        env = "RDS_HOST_KEY",
        help = "Path to the pinned appliance host public key"
    )]
    rds_host_key: Option<PathBuf>,

    #[structopt(
        long = "insecure-skip-host-key",
        help = "Disable host key verification (test deployments only)"
    )]
    insecure_skip_host_key: bool,

    #[structopt(
        long = "volume-base-path",
        env = "RDS_VOLUME_BASE_PATH",
        default_value = "raid1/csi",
        help = "Appliance directory holding volume backing files"
    )]
    volume_base_path: String,

    #[structopt(
        long = "default-nvme-port",
        default_value = "4420",
        help = "NVMe/TCP port used for new exports"
    )]
    default_nvme_port: u16,

    #[structopt(
        long = "resolver-ttl",
        default_value = "10",
        help = "Device resolver cache TTL in seconds"
    )]
    resolver_ttl_secs: u64,

    #[structopt(
        long = "nvme-connect-timeout",
        default_value = "30",
        help = "Seconds to wait for a block device after nvme connect"
    )]
    connect_timeout_secs: u64,

    #[structopt(
        long = "device-poll-interval",
        default_value = "500",
        help = "Milliseconds between device appearance polls"
    )]
    device_poll_interval_ms: u64,

    #[structopt(
        long = "normal-unmount-wait",
        default_value = "10",
        help = "Seconds a busy unmount may take before escalation is considered"
    )]
    normal_unmount_wait_secs: u64,

    #[structopt(
        long = "recovery-max-attempts",
        default_value = "3",
        help = "Mount recovery attempts before giving up"
    )]
    recovery_max_attempts: u32,

    #[structopt(
        long = "recovery-initial-backoff",
        default_value = "1",
        help = "Seconds of backoff before the second recovery attempt"
    )]
    recovery_initial_backoff_secs: u64,

    #[structopt(
        long = "attachment-grace-period",
        default_value = "30",
        help = "Seconds after detach during which a cross-node attach is a handoff"
    )]
    attachment_grace_period_secs: u64,

    #[structopt(
        long = "reconcile-interval",
        default_value = "300",
        help = "Seconds between attachment reconciler ticks"
    )]
    reconcile_interval_secs: u64,

    #[structopt(long = "disable-reconciler", help = "Do not run the attachment reconciler")]
    disable_reconciler: bool,

    #[structopt(
        long = "enable-multi-node-writer",
        help = "Accept MULTI_NODE_MULTI_WRITER volumes for live migration"
    )]
    enable_multi_node_writer: bool,

    #[structopt(
        long = "metrics-endpoint",
        env = "RDS_CSI_METRICS_ENDPOINT",
        help = "Bind address for Prometheus exposition, e.g. 0.0.0.0:9809"
    )]
    metrics_endpoint: Option<SocketAddr>,
}
