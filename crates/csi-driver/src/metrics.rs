//! Driver metrics. The registry is the default prometheus registry,
//! initialized once through these statics; the optional exposition server
//! is started by the binary when a metrics endpoint is configured.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Successful volume attachments.
    pub static ref VOLUME_ATTACH_TOTAL: IntCounter = register_int_counter!(
        "rds_csi_volume_attach_total",
        "Number of successful ControllerPublishVolume operations"
    )
    .expect("attach counter can be registered");

    /// Successful volume detachments.
    pub static ref VOLUME_DETACH_TOTAL: IntCounter = register_int_counter!(
        "rds_csi_volume_detach_total",
        "Number of successful ControllerUnpublishVolume operations"
    )
    .expect("detach counter can be registered");

    /// Cross-node attaches admitted inside the detach grace period.
    pub static ref GRACE_PERIOD_HANDOFF_TOTAL: IntCounter = register_int_counter!(
        "rds_csi_grace_period_handoff_total",
        "Number of cross-node attaches admitted within the detach grace period"
    )
    .expect("handoff counter can be registered");

    /// Attachments cleared because their node no longer exists.
    pub static ref STALE_CLEARED_TOTAL: IntCounter = register_int_counter!(
        "rds_csi_stale_cleared_total",
        "Number of attachments cleared by the reconciler for deleted nodes"
    )
    .expect("stale-cleared counter can be registered");

    /// Stale mounts noticed on access or during stats collection.
    pub static ref STALE_MOUNT_DETECTED_TOTAL: IntCounter = register_int_counter!(
        "rds_csi_stale_mount_detected_total",
        "Number of times a staged mount was found stale"
    )
    .expect("stale-mount counter can be registered");

    /// Mount recoveries by outcome.
    pub static ref MOUNT_RECOVERY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rds_csi_mount_recovery_total",
        "Number of mount recovery runs by outcome",
        &["outcome"]
    )
    .expect("recovery counter can be registered");

    /// Time spent tracking an attachment, persistence included.
    pub static ref ATTACH_DURATION_SECONDS: Histogram = register_histogram!(
        "rds_csi_attach_duration_seconds",
        "Latency of attachment tracking including persistence"
    )
    .expect("attach histogram can be registered");
}

/// Renders the registry in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

/// Serves `/metrics` on the given address until the process exits. Used by
/// the binary; the core never starts it on its own.
pub async fn serve(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Response};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|_req| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::from(gather())))
        }))
    });
    hyper::Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_render() {
        STALE_MOUNT_DETECTED_TOTAL.inc();
        MOUNT_RECOVERY_TOTAL.with_label_values(&["success"]).inc();
        let rendered = gather();
        assert!(rendered.contains("rds_csi_stale_mount_detected_total"));
        assert!(rendered.contains("rds_csi_mount_recovery_total"));
    }
}
