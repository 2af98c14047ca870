//! Argus - Network-Device Monitoring Orchestrator
//!
//! This crate provides the core functionality of the Argus monitoring
//! system. It can be used as a library by other Rust projects, or run as a
//! standalone binary with the `argus` executable.
//!
//! # Architecture
//!
//! - **Registry**: in-memory entity records (credentials, discoveries,
//!   devices, metrics), write-through over a pluggable store
//! - **Prober**: discovery pipeline (ping, port check, credential probe)
//! - **Scheduler**: priority-queue due-time tracking per (device, metric) pair
//! - **Poller**: bounded-concurrency execution of the external probing program
//! - **Sink**: best-effort file archive of poll results
//! - **Server**: JSON management API (CRUD, run discovery, provision)
//!
//! # Example
//!
//! ```rust,ignore
//! use argus::{MemStore, Plugin, PollExecutor, Registry, Scheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(Registry::load(Arc::new(MemStore::new())).await?);
//!     // Wire channels, spawn the scheduler, executor and sink...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod poller;
pub mod prober;
pub mod provision;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod sink;

pub use config::AppConfig;
pub use poller::{PollExecutor, PollerConfig};
pub use poller::plugin::{Plugin, PluginConfig, PluginError};
pub use prober::{ProbeError, Prober, ProberConfig};
pub use provision::{ProvisionError, provision};
pub use registry::{
    CredentialProfile, CredentialSecrets, Device, DeviceStatus, DeviceType, DiscoveryCandidate,
    EntityId, MemStore, MetricDefinition, Protocol, Registry, RegistryError, Store, StoreError,
};
pub use scheduler::{PollRequest, ProvisionEvent, Scheduler, SchedulerConfig};
pub use server::{AppState, create_router};
pub use sink::{ArchiveConfig, FileSink, PollResult};
