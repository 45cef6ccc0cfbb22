//! The CSI Identity service.

use std::sync::Arc;

use k8s_csi::v1_3_0::plugin_capability::service::Type as ServiceType;
use k8s_csi::v1_3_0::plugin_capability::{Service, Type as PluginType};
use k8s_csi::v1_3_0::{
    identity_server::Identity, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use tracing::debug;

use crate::appliance::Appliance;

/// Identity: plugin name, capabilities, and readiness.
pub struct IdentityService {
    rds: Arc<dyn Appliance>,
    name: String,
    version: String,
}

impl IdentityService {
    /// An identity service reporting `name`/`version` and probing the
    /// appliance client for readiness.
    pub fn new(
        rds: Arc<dyn Appliance>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        IdentityService {
            rds,
            name: name.into(),
            version: version.into(),
        }
    }
}

#[async_trait::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: tonic::Request<GetPluginInfoRequest>,
    ) -> Result<tonic::Response<GetPluginInfoResponse>, tonic::Status> {
        if self.name.is_empty() || self.version.is_empty() {
            return Err(tonic::Status::unavailable(
                "driver name or version not configured",
            ));
        }
        Ok(tonic::Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: tonic::Request<GetPluginCapabilitiesRequest>,
    ) -> Result<tonic::Response<GetPluginCapabilitiesResponse>, tonic::Status> {
        Ok(tonic::Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![
                PluginCapability {
                    r#type: Some(PluginType::Service(Service {
                        r#type: ServiceType::ControllerService as i32,
                    })),
                },
                PluginCapability {
                    r#type: Some(PluginType::Service(Service {
                        r#type: ServiceType::VolumeAccessibilityConstraints as i32,
                    })),
                },
            ],
        }))
    }

    /// Ready once the appliance client reports connected. A probe on a
    /// disconnected client attempts one reconnect so a restarted appliance
    /// flips the driver back to ready without outside help.
    async fn probe(
        &self,
        _request: tonic::Request<ProbeRequest>,
    ) -> Result<tonic::Response<ProbeResponse>, tonic::Status> {
        if !self.rds.is_connected() {
            if let Err(e) = self.rds.connect().await {
                debug!(error = %e, "probe reconnect attempt failed");
            }
        }
        Ok(tonic::Response::new(ProbeResponse {
            ready: Some(self.rds.is_connected()),
        }))
    }
}
