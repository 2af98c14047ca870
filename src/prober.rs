//! Discovery pipeline.
//!
//! Decides whether a discovery candidate can be admitted for provisioning:
//! reachability ping, then a TCP port check, then a credential probe through
//! the probing program. The pipeline short-circuits on the first failing
//! stage: a device that does not answer ping never sees a port check or a
//! subprocess.
//!
//! Stage failures have different weights: `DeviceDown` and `PortClosed` are
//! negative results that leave the candidate record untouched, while a
//! failed credential probe degrades the candidate to Down with cleared
//! fields so management can retry later. Only the persistence step can fail
//! the operation itself.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::poller::plugin::{DiscoverPayload, Plugin, PluginMode};
use crate::registry::{DeviceStatus, DiscoveryCandidate, EntityId, Registry, RegistryError};

/// Well-known SNMP port; the port check is skipped for it since SNMP speaks
/// UDP and a TCP connect would be meaningless.
pub const SNMP_PORT: u16 = 161;

/// Default discovery pool size. Discovery is infrequent and user-triggered,
/// so the pool stays small.
pub const DEFAULT_WORKERS: usize = 10;

/// Default overall ping budget.
pub const DEFAULT_PING_BUDGET: Duration = Duration::from_secs(5);

/// Default number of echo requests within the ping budget.
pub const DEFAULT_PING_PACKETS: u16 = 5;

/// Default TCP connect timeout for the port check.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(2);

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_ping_budget() -> Duration {
    DEFAULT_PING_BUDGET
}

fn default_ping_packets() -> u16 {
    DEFAULT_PING_PACKETS
}

fn default_port_timeout() -> Duration {
    DEFAULT_PORT_TIMEOUT
}

/// Discovery pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    /// Discovery pool size, independent of the polling pool.
    pub workers: usize,

    /// Overall reachability budget.
    #[serde(with = "humantime_serde")]
    pub ping_budget: Duration,

    /// Echo requests attempted within the budget.
    pub ping_packets: u16,

    /// TCP connect timeout for the port check.
    #[serde(with = "humantime_serde")]
    pub port_timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            ping_budget: default_ping_budget(),
            ping_packets: default_ping_packets(),
            port_timeout: default_port_timeout(),
        }
    }
}

/// Errors and negative results from the discovery pipeline.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Reachability failed; later stages were not run and the candidate was
    /// not modified.
    #[error("device is down, ping failed")]
    DeviceDown,

    /// Device answers ping but the target port does not accept connections.
    #[error("device reachable but port is closed")]
    PortClosed,

    /// Missing entities or a failed candidate persistence. A store failure
    /// aborts the pipeline with the cached candidate untouched.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Multi-stage discovery prober.
pub struct Prober {
    registry: Arc<Registry>,
    plugin: Plugin,
    config: ProberConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("available_workers", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Prober {
    pub fn new(registry: Arc<Registry>, plugin: Plugin, config: ProberConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            registry,
            plugin,
            config,
            permits,
        }
    }

    /// Run the full pipeline for one candidate and return its updated record.
    ///
    /// Safe to repeat: each run re-derives the status from scratch. The
    /// candidate becomes visible as changed only after the store accepted the
    /// update.
    pub async fn probe(&self, discovery_id: EntityId) -> Result<DiscoveryCandidate, ProbeError> {
        let candidate = self.registry.discovery(discovery_id)?;

        // Resolve candidate profiles up front; a dangling profile id is a
        // management error and fails the operation before any network I/O.
        let mut profiles = Vec::with_capacity(candidate.credential_profiles.len());
        for profile_id in &candidate.credential_profiles {
            profiles.push(self.registry.credential(*profile_id)?);
        }

        // The pool semaphore lives as long as the prober and is never closed.
        let Ok(_permit) = self.permits.acquire().await else {
            return Err(ProbeError::DeviceDown);
        };

        if !self.ping(&candidate.ip).await {
            tracing::info!(ip = %candidate.ip, "Ping failed, device down");
            return Err(ProbeError::DeviceDown);
        }

        if candidate.port != SNMP_PORT && !self.port_open(&candidate.ip, candidate.port).await {
            tracing::info!(ip = %candidate.ip, port = candidate.port, "Port closed");
            return Err(ProbeError::PortClosed);
        }

        let payload = DiscoverPayload {
            event_type: PluginMode::Discover,
            ip: candidate.ip.clone(),
            port: candidate.port,
            device_type: candidate.device_type,
            credential_profiles: profiles,
        };

        let mut updated = candidate;
        match self.plugin.discover(&payload).await {
            Ok(reply) => {
                updated.resolved_profile = reply.profile_id;
                updated.hostname = reply.hostname.map(|h| h.trim().to_string());
                updated.status = match reply.status.as_deref().map(str::trim) {
                    Some("Up") => DeviceStatus::Up,
                    _ => DeviceStatus::Down,
                };
                tracing::info!(
                    ip = %updated.ip,
                    status = %updated.status,
                    hostname = updated.hostname.as_deref().unwrap_or("-"),
                    "Credential probe completed"
                );
            }
            Err(e) => {
                // Degrades to a Down result rather than erroring the whole
                // operation; management can re-run the discovery later.
                tracing::warn!(ip = %updated.ip, error = %e, "Credential probe failed, marking device down");
                updated.resolved_profile = None;
                updated.hostname = None;
                updated.status = DeviceStatus::Down;
            }
        }

        self.registry.update_discovery(updated.clone()).await?;
        Ok(updated)
    }

    /// Reachability stage: any echo reply within the budget counts as up.
    ///
    /// An unusable ICMP socket (missing capability, sandbox) is reported as
    /// down: reachability cannot be verified, so the device is not admitted.
    pub(crate) async fn ping(&self, host: &str) -> bool {
        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(host, error = %e, "Not a valid address, ping skipped");
                return false;
            }
        };

        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = match Client::new(&config) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(host, error = %e, "ICMP client unavailable, treating device as down");
                return false;
            }
        };

        let packets = self.config.ping_packets.max(1);
        let per_packet = self.config.ping_budget / u32::from(packets);
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(per_packet);

        for seq in 0..packets {
            if pinger.ping(PingSequence(seq), &[]).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Port-check stage: TCP connect under a short timeout.
    pub(crate) async fn port_open(&self, host: &str, port: u16) -> bool {
        matches!(
            timeout(self.config.port_timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}
