//! The CSI gRPC surface and the composition root that wires the driver's
//! components together and serves them.

pub mod controller;
pub mod identity;
pub mod node;

use std::future::Future;
use std::sync::Arc;

use k8s_csi::v1_3_0::controller_server::ControllerServer;
use k8s_csi::v1_3_0::identity_server::IdentityServer;
use k8s_csi::v1_3_0::node_server::NodeServer;
use rds_client::{RdsClient, RdsConfig, SshConfig};
use tracing::{info, warn};

pub use controller::{ControllerService, ControllerSettings};
pub use identity::IdentityService;
pub use node::NodeService;

use crate::appliance::Appliance;
use crate::attachment::reconciler::{AttachmentReconciler, ReconcilerConfig};
use crate::attachment::AttachmentManager;
use crate::config::Config;
use crate::device::DeviceResolver;
use crate::events::EventRecorder;
use crate::grpc_sock::{self, Endpoint};
use crate::mount::{MountConfig, MountManager, Mounter};
use crate::nvme::{Connector, NvmeConnector};
use crate::{DRIVER_NAME, DRIVER_VERSION};

fn rds_config(config: &Config) -> RdsConfig {
    let mut ssh = SshConfig::new(
        config.rds_address.clone(),
        config.rds_user.clone(),
        config.rds_private_key.clone(),
    );
    ssh.port = config.rds_ssh_port;
    ssh.host_key = config.rds_host_key.clone();
    ssh.insecure_skip_host_key = config.insecure_skip_host_key;
    RdsConfig {
        ssh,
        base_path: config.volume_base_path.clone(),
    }
}

/// Builds the configured service set and serves it until `shutdown`
/// resolves. In controller mode this also restores the attachment table
/// from PV annotations and runs the reconciler.
pub async fn serve(
    config: Config,
    kube_client: kube::Client,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    if !config.run_controller && !config.run_node {
        anyhow::bail!("neither controller nor node mode selected, nothing to serve");
    }

    let rds: Arc<RdsClient> = Arc::new(RdsClient::new(rds_config(&config)));
    if let Err(e) = Appliance::connect(rds.as_ref()).await {
        // Not fatal: Probe reports unready and retries until the appliance
        // answers.
        warn!(error = %e, "appliance not reachable at startup");
    }

    let events = EventRecorder::new(kube_client.clone());
    let identity = IdentityService::new(
        rds.clone() as Arc<dyn Appliance>,
        DRIVER_NAME,
        DRIVER_VERSION,
    );

    let mut reconciler: Option<Arc<AttachmentReconciler>> = None;
    let controller = if config.run_controller {
        let attachments = Arc::new(AttachmentManager::new(kube_client.clone()));
        match attachments.restore().await {
            Ok(restored) => info!(restored, "attachment table restored"),
            Err(e) => warn!(error = %e, "attachment restore failed, starting with an empty table"),
        }
        if config.reconciler_enabled {
            let r = AttachmentReconciler::new(
                attachments.clone(),
                kube_client.clone(),
                events.clone(),
                ReconcilerConfig {
                    interval: config.reconcile_interval,
                    grace_period: config.attachment_grace_period,
                },
            );
            r.start().await;
            reconciler = Some(r);
        }
        Some(ControllerServer::new(ControllerService::new(
            rds.clone() as Arc<dyn Appliance>,
            attachments,
            events.clone(),
            ControllerSettings {
                target_address: config.rds_address.clone(),
                default_nvme_port: config.default_nvme_port,
                grace_period: config.attachment_grace_period,
                enable_multi_node_writer: config.enable_multi_node_writer,
            },
        )))
    } else {
        None
    };

    let node = if config.run_node {
        if config.node_id.is_empty() {
            anyhow::bail!("node mode requires a node ID");
        }
        let resolver = Arc::new(DeviceResolver::new(config.resolver_ttl));
        let connector = NvmeConnector::new(
            resolver.clone(),
            config.connect_timeout,
            config.device_poll_interval,
        );
        let mounter = Arc::new(MountManager::new(
            resolver,
            MountConfig {
                normal_unmount_wait: config.normal_unmount_wait,
                recovery_max_attempts: config.recovery_max_attempts,
                recovery_initial_backoff: config.recovery_initial_backoff,
            },
        ));
        Some(NodeServer::new(NodeService::new(
            connector as Arc<dyn Connector>,
            mounter as Arc<dyn Mounter>,
            events,
            config.node_id.clone(),
        )))
    } else {
        None
    };

    let router = tonic::transport::Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller)
        .add_optional_service(node);

    match Endpoint::parse(&config.endpoint)? {
        Endpoint::Unix(path) => {
            // A previous run may have left its socket behind.
            match tokio::fs::remove_file(&path).await {
                Ok(_) => (),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound) => (),
                Err(e) => return Err(e.into()),
            }
            let socket = grpc_sock::server::Socket::new(&path)?;
            info!(socket = %path.display(), "serving CSI services");
            router
                .serve_with_incoming_shutdown(socket, shutdown)
                .await?;
        }
        Endpoint::Tcp(addr) => {
            info!(%addr, "serving CSI services");
            router.serve_with_shutdown(addr, shutdown).await?;
        }
    }

    if let Some(reconciler) = reconciler {
        reconciler.stop().await;
    }
    rds.close().await;
    info!("driver stopped");
    Ok(())
}
