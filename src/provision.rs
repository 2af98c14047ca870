//! Provisioning admission.
//!
//! Promotes a verified discovery candidate into a polled device: the
//! candidate's address and resolved credential are copied into a Device
//! record, one metric definition is inserted per metric group of the
//! device's type, and only after every insertion has durably succeeded is
//! the provisioned event emitted; a partial metric set is never admitted
//! for scheduling.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::registry::{Device, DeviceStatus, DeviceType, EntityId, MetricDefinition, Registry, RegistryError};
use crate::scheduler::ProvisionEvent;

/// Metric groups and poll intervals per device type, seconds.
const LINUX_METRICS: &[(&str, u64)] = &[
    ("Linux.Device", 300),
    ("Linux.CPU", 60),
    ("Linux.Process", 120),
    ("Linux.Disk", 180),
];

const SNMP_METRICS: &[(&str, u64)] = &[("SNMP.Device", 300), ("SNMP.Interface", 120)];

/// The fixed metric set appropriate to a device type.
pub fn metric_plan(device_type: DeviceType) -> &'static [(&'static str, u64)] {
    match device_type {
        DeviceType::Linux => LINUX_METRICS,
        DeviceType::Snmp => SNMP_METRICS,
    }
}

/// Errors from provisioning admission.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A device with this address already exists.
    #[error("device with address {0} is already provisioned")]
    AlreadyProvisioned(String),

    /// The candidate has not been verified Up with a resolved credential.
    #[error("discovery candidate has not been verified up")]
    NotVerified,

    /// Lookup or persistence failure; when metric insertion fails the
    /// provisioned event is not emitted.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Promote an Up discovery candidate into a polled device.
///
/// Returns the created device. The scheduler consumes the emitted event and
/// defers each metric's first poll by one full interval.
pub async fn provision(
    registry: &Arc<Registry>,
    events: &mpsc::Sender<ProvisionEvent>,
    discovery_id: EntityId,
) -> Result<Device, ProvisionError> {
    let candidate = registry.discovery(discovery_id)?;

    if candidate.status != DeviceStatus::Up {
        return Err(ProvisionError::NotVerified);
    }
    let Some(profile_id) = candidate.resolved_profile else {
        return Err(ProvisionError::NotVerified);
    };
    if registry.device_with_ip(&candidate.ip).is_some() {
        return Err(ProvisionError::AlreadyProvisioned(candidate.ip));
    }

    let device = registry
        .insert_device(Device {
            id: 0,
            profile_id,
            ip: candidate.ip.clone(),
            port: candidate.port,
            hostname: candidate.hostname.clone(),
            device_type: candidate.device_type,
        })
        .await?;

    for (group, secs) in metric_plan(candidate.device_type) {
        registry
            .insert_metric(MetricDefinition {
                id: 0,
                device_id: device.id,
                group: (*group).to_string(),
                interval: Duration::from_secs(*secs),
                last_polled: None,
            })
            .await?;
    }

    if events.send(ProvisionEvent { device_id: device.id }).await.is_err() {
        tracing::warn!(
            device_id = device.id,
            "Scheduler unavailable, provisioned device not admitted until restart"
        );
    }

    tracing::info!(
        device_id = device.id,
        ip = %device.ip,
        device_type = %device.device_type,
        metrics = metric_plan(device.device_type).len(),
        "Device provisioned"
    );

    Ok(device)
}
