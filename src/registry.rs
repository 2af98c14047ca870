//! In-memory entity registry, write-through over the persistent store.
//!
//! The registry is the sole owner of entity records. It is populated from the
//! store at startup and mutated through its accessors afterwards; every
//! mutation hits the store first and the cache only on success, so a
//! persistence failure never leaves the two views disagreeing. The one
//! exception is [`Registry::record_poll`], which must not block the
//! scheduling timeline and therefore mirrors to the store asynchronously.
//!
//! Concurrent reads and writes are expected from the scheduler, poller,
//! prober and the management API; each table is independently guarded and no
//! lock is held across an await point.

mod store;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use store::{MemStore, Store, StoreError};
pub use types::{
    CredentialProfile, CredentialSecrets, Device, DeviceStatus, DeviceType, DiscoveryCandidate,
    EntityId, EntityKind, MetricDefinition, Protocol,
};

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No entity with this id. Normally a caller logic error: components only
    /// hold ids they obtained from the registry.
    #[error("{kind} record {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },

    /// The store rejected the operation; the cache was left untouched.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persisted record did not match the entity schema.
    #[error("malformed {kind} record: {source}")]
    Decode {
        kind: EntityKind,
        source: serde_json::Error,
    },

    /// An entity could not be encoded for the store.
    #[error("failed to encode {kind} record: {source}")]
    Encode {
        kind: EntityKind,
        source: serde_json::Error,
    },
}

type Table<T> = RwLock<HashMap<EntityId, T>>;

fn read<T>(table: &Table<T>) -> RwLockReadGuard<'_, HashMap<EntityId, T>> {
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(table: &Table<T>) -> RwLockWriteGuard<'_, HashMap<EntityId, T>> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}

async fn load_table<T: DeserializeOwned>(
    store: &dyn Store,
    kind: EntityKind,
) -> Result<HashMap<EntityId, T>, RegistryError> {
    let mut rows = HashMap::new();
    for (id, value) in store.load(kind).await? {
        let record =
            serde_json::from_value(value).map_err(|source| RegistryError::Decode { kind, source })?;
        rows.insert(id, record);
    }
    Ok(rows)
}

fn encode<T: Serialize>(kind: EntityKind, entity: &T) -> Result<serde_json::Value, RegistryError> {
    serde_json::to_value(entity).map_err(|source| RegistryError::Encode { kind, source })
}

/// Registry of all monitored entities.
pub struct Registry {
    store: Arc<dyn Store>,
    credentials: Table<CredentialProfile>,
    discoveries: Table<DiscoveryCandidate>,
    devices: Table<Device>,
    metrics: Table<MetricDefinition>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("credentials", &read(&self.credentials).len())
            .field("discoveries", &read(&self.discoveries).len())
            .field("devices", &read(&self.devices).len())
            .field("metrics", &read(&self.metrics).len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Populate the registry from the store. Called once at startup, before
    /// any component is wired up.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self, RegistryError> {
        let credentials = load_table(&*store, EntityKind::Credential).await?;
        let discoveries = load_table(&*store, EntityKind::Discovery).await?;
        let devices = load_table(&*store, EntityKind::Device).await?;
        let metrics = load_table(&*store, EntityKind::Metric).await?;

        tracing::info!(
            credentials = credentials.len(),
            discoveries = discoveries.len(),
            devices = devices.len(),
            metrics = metrics.len(),
            "Registry loaded"
        );

        Ok(Self {
            store,
            credentials: RwLock::new(credentials),
            discoveries: RwLock::new(discoveries),
            devices: RwLock::new(devices),
            metrics: RwLock::new(metrics),
        })
    }

    // =========================================================================
    // Credential profiles
    // =========================================================================

    pub fn credential(&self, id: EntityId) -> Result<CredentialProfile, RegistryError> {
        read(&self.credentials)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound {
                kind: EntityKind::Credential,
                id,
            })
    }

    pub fn credentials(&self) -> Vec<CredentialProfile> {
        read(&self.credentials).values().cloned().collect()
    }

    /// True when another profile already uses this name.
    pub fn credential_name_taken(&self, name: &str, exclude: Option<EntityId>) -> bool {
        read(&self.credentials)
            .values()
            .any(|p| p.name == name && Some(p.id) != exclude)
    }

    pub async fn insert_credential(
        &self,
        mut profile: CredentialProfile,
    ) -> Result<CredentialProfile, RegistryError> {
        let record = encode(EntityKind::Credential, &profile)?;
        profile.id = self.store.insert(EntityKind::Credential, record).await?;
        write(&self.credentials).insert(profile.id, profile.clone());
        Ok(profile)
    }

    pub async fn update_credential(
        &self,
        profile: CredentialProfile,
    ) -> Result<(), RegistryError> {
        let record = encode(EntityKind::Credential, &profile)?;
        self.store
            .update(EntityKind::Credential, profile.id, record)
            .await?;
        write(&self.credentials).insert(profile.id, profile);
        Ok(())
    }

    pub async fn remove_credential(&self, id: EntityId) -> Result<(), RegistryError> {
        self.store.remove(EntityKind::Credential, id).await?;
        write(&self.credentials).remove(&id);
        Ok(())
    }

    // =========================================================================
    // Discovery candidates
    // =========================================================================

    pub fn discovery(&self, id: EntityId) -> Result<DiscoveryCandidate, RegistryError> {
        read(&self.discoveries)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound {
                kind: EntityKind::Discovery,
                id,
            })
    }

    pub fn discoveries(&self) -> Vec<DiscoveryCandidate> {
        read(&self.discoveries).values().cloned().collect()
    }

    pub fn discovery_name_taken(&self, name: &str, exclude: Option<EntityId>) -> bool {
        read(&self.discoveries)
            .values()
            .any(|d| d.name == name && Some(d.id) != exclude)
    }

    pub async fn insert_discovery(
        &self,
        mut candidate: DiscoveryCandidate,
    ) -> Result<DiscoveryCandidate, RegistryError> {
        let record = encode(EntityKind::Discovery, &candidate)?;
        candidate.id = self.store.insert(EntityKind::Discovery, record).await?;
        write(&self.discoveries).insert(candidate.id, candidate.clone());
        Ok(candidate)
    }

    pub async fn update_discovery(
        &self,
        candidate: DiscoveryCandidate,
    ) -> Result<(), RegistryError> {
        let record = encode(EntityKind::Discovery, &candidate)?;
        self.store
            .update(EntityKind::Discovery, candidate.id, record)
            .await?;
        write(&self.discoveries).insert(candidate.id, candidate);
        Ok(())
    }

    pub async fn remove_discovery(&self, id: EntityId) -> Result<(), RegistryError> {
        self.store.remove(EntityKind::Discovery, id).await?;
        write(&self.discoveries).remove(&id);
        Ok(())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub fn device(&self, id: EntityId) -> Result<Device, RegistryError> {
        read(&self.devices)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound {
                kind: EntityKind::Device,
                id,
            })
    }

    pub fn devices(&self) -> Vec<Device> {
        read(&self.devices).values().cloned().collect()
    }

    /// The provisioned device at this address, if any. One device per address.
    pub fn device_with_ip(&self, ip: &str) -> Option<Device> {
        read(&self.devices).values().find(|d| d.ip == ip).cloned()
    }

    pub async fn insert_device(&self, mut device: Device) -> Result<Device, RegistryError> {
        let record = encode(EntityKind::Device, &device)?;
        device.id = self.store.insert(EntityKind::Device, record).await?;
        write(&self.devices).insert(device.id, device.clone());
        Ok(device)
    }

    // =========================================================================
    // Metric definitions
    // =========================================================================

    pub fn metric(&self, id: EntityId) -> Result<MetricDefinition, RegistryError> {
        read(&self.metrics)
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound {
                kind: EntityKind::Metric,
                id,
            })
    }

    pub fn metrics(&self) -> Vec<MetricDefinition> {
        read(&self.metrics).values().cloned().collect()
    }

    /// Every metric definition owned by a device.
    pub fn metrics_for_device(&self, device_id: EntityId) -> Vec<MetricDefinition> {
        read(&self.metrics)
            .values()
            .filter(|m| m.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn insert_metric(
        &self,
        mut metric: MetricDefinition,
    ) -> Result<MetricDefinition, RegistryError> {
        let record = encode(EntityKind::Metric, &metric)?;
        metric.id = self.store.insert(EntityKind::Metric, record).await?;
        write(&self.metrics).insert(metric.id, metric.clone());
        Ok(metric)
    }

    /// Record a dispatch time for a metric.
    ///
    /// Cache is updated synchronously; the store mirror runs on a spawned
    /// task so the scheduling timeline never waits on store I/O. `last_polled`
    /// has a single causal writer (the scheduler), so a lost mirror only
    /// shifts the first due time after a restart. Must be called from within
    /// the runtime.
    pub fn record_poll(&self, metric_id: EntityId, ts: DateTime<Utc>) {
        let updated = {
            let mut metrics = write(&self.metrics);
            match metrics.get_mut(&metric_id) {
                Some(metric) => {
                    metric.last_polled = Some(ts);
                    metric.clone()
                }
                None => {
                    tracing::warn!(metric_id, "Last-polled update for unknown metric");
                    return;
                }
            }
        };

        match serde_json::to_value(&updated) {
            Ok(record) => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Err(e) = store.update(EntityKind::Metric, metric_id, record).await {
                        tracing::warn!(metric_id, error = %e, "Last-polled store mirror failed");
                    }
                });
            }
            Err(e) => tracing::warn!(metric_id, error = %e, "Last-polled encode failed"),
        }
    }
}
