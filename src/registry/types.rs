//! Entity records held by the registry.
//!
//! Four entity kinds cross the persistence boundary as JSON documents:
//! credential profiles, discovery candidates, provisioned devices and metric
//! definitions. Records are plain data; all lifecycle rules live in the
//! components that own them (the prober mutates candidates, the scheduler
//! writes `last_polled`, provisioning creates devices and metrics).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Numeric identifier assigned by the persistent store.
pub type EntityId = u64;

/// Kind discriminator used by registry tables and store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Credential,
    Discovery,
    Device,
    Metric,
}

/// Protocol spoken by a credential profile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
pub enum Protocol {
    #[serde(rename = "SSH")]
    #[strum(serialize = "SSH")]
    Ssh,
    #[serde(rename = "SNMP")]
    #[strum(serialize = "SNMP")]
    Snmp,
}

/// Declared type of a monitored device, selecting its metric set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
pub enum DeviceType {
    #[serde(rename = "Linux")]
    #[strum(serialize = "Linux")]
    Linux,
    #[serde(rename = "SNMP")]
    #[strum(serialize = "SNMP")]
    Snmp,
}

/// Reachability status of a discovery candidate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
pub enum DeviceStatus {
    #[default]
    Down,
    Up,
}

/// Protocol-specific secrets of a credential profile.
///
/// Serialized flattened into the enclosing profile, so an SSH profile reads
/// `{"protocol":"SSH","username":...,"password":...}` on the wire and in the
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialSecrets {
    Ssh { username: String, password: String },
    Snmp { community: String, version: String },
}

impl CredentialSecrets {
    /// Protocol these secrets belong to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Ssh { .. } => Protocol::Ssh,
            Self::Snmp { .. } => Protocol::Snmp,
        }
    }
}

/// A named set of credentials used to authenticate against devices.
///
/// In-flight probes and polls operate on snapshot copies; management updates
/// never reach work already dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialProfile {
    pub id: EntityId,
    pub name: String,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub secrets: CredentialSecrets,
}

/// A registered network address pending reachability and credential
/// verification. Mutated only by the prober; never polled directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCandidate {
    pub id: EntityId,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub device_type: DeviceType,
    /// Candidate profiles, in the order the probing program should try them.
    pub credential_profiles: Vec<EntityId>,
    /// Profile the probing program validated, once discovery succeeded.
    #[serde(default)]
    pub resolved_profile: Option<EntityId>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
}

/// A provisioned device admitted for polling. Created once, from an Up
/// discovery candidate; immutable within the core afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: EntityId,
    pub profile_id: EntityId,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub hostname: Option<String>,
    pub device_type: DeviceType,
}

/// One metric group attached to a device, polled at its own cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: EntityId,
    pub device_id: EntityId,
    /// Metric group name, e.g. `"Linux.CPU"`.
    pub group: String,
    /// Poll interval, second granularity.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Last dispatch time, written only by the scheduler.
    #[serde(default)]
    pub last_polled: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_profile_flattens_secrets() {
        let profile = CredentialProfile {
            id: 7,
            name: "lab-ssh".to_string(),
            protocol: Protocol::Ssh,
            secrets: CredentialSecrets::Ssh {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        };

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["protocol"], "SSH");
        assert_eq!(json["username"], "admin");
        assert_eq!(json["password"], "secret");
        assert!(json.get("secrets").is_none());

        let back: CredentialProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_snmp_secrets_deserialize() {
        let profile: CredentialProfile = serde_json::from_str(
            r#"{"id":1,"name":"core-snmp","protocol":"SNMP","community":"public","version":"v2c"}"#,
        )
        .unwrap();
        assert_eq!(profile.protocol, Protocol::Snmp);
        assert_eq!(profile.secrets.protocol(), Protocol::Snmp);
    }

    #[test]
    fn test_device_type_strings() {
        assert_eq!(DeviceType::Linux.as_ref(), "Linux");
        assert_eq!(DeviceType::Snmp.as_ref(), "SNMP");
        assert_eq!("SNMP".parse::<DeviceType>().unwrap(), DeviceType::Snmp);
    }

    #[test]
    fn test_metric_definition_interval_roundtrip() {
        let metric = MetricDefinition {
            id: 3,
            device_id: 9,
            group: "Linux.CPU".to_string(),
            interval: Duration::from_secs(60),
            last_polled: None,
        };

        let json = serde_json::to_string(&metric).unwrap();
        let back: MetricDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.interval, Duration::from_secs(60));
        assert!(back.last_polled.is_none());
    }

    #[test]
    fn test_default_status_is_down() {
        let candidate: DiscoveryCandidate = serde_json::from_str(
            r#"{"id":1,"name":"edge","ip":"10.0.0.5","port":22,
                "device_type":"Linux","credential_profiles":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(candidate.status, DeviceStatus::Down);
        assert!(candidate.resolved_profile.is_none());
        assert!(candidate.hostname.is_none());
    }
}
