//! External probing-program invocation.
//!
//! The protocol-level device interaction (SSH/SNMP) lives in a separate
//! executable. Its contract: argv[1] is one compact JSON document whose
//! `event_type` selects the mode; exit code 0 with a JSON document on stdout
//! is success, anything else is failure with stdout+stderr captured for
//! diagnostics.
//!
//! Poll mode request:
//! `{"event_type":"poll","ip","port","device_type","metric_group",
//!   "protocol","username","password"}` (or `"community","version"`).
//!
//! Discover mode request:
//! `{"event_type":"discover","ip","port","device_type",
//!   "credential_profiles":[...]}` with full profile records, in order.
//! Discover reply: `{"credential.profile.id","hostname","status"}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::registry::{CredentialProfile, CredentialSecrets, DeviceType, EntityId, Protocol};
use crate::scheduler::PollRequest;

/// Default budget for one poll invocation.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default budget for one discover invocation.
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(60);

fn default_poll_timeout() -> Duration {
    DEFAULT_POLL_TIMEOUT
}

fn default_discover_timeout() -> Duration {
    DEFAULT_DISCOVER_TIMEOUT
}

fn default_plugin_path() -> PathBuf {
    PathBuf::from("./plugin/probe")
}

/// Errors from a probing-program invocation.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The program did not exit within its budget; it has been terminated.
    /// Never fatal; the next scheduled attempt retries naturally.
    #[error("probing program timed out")]
    Timeout,

    /// The program could not be spawned or waited on.
    #[error("failed to run probing program: {0}")]
    Spawn(#[from] std::io::Error),

    /// Non-zero exit; captured output attached.
    #[error("probing program exited with status {status}: {output}")]
    NonZeroExit { status: i32, output: String },

    /// Exit 0 but stdout was not the expected JSON; raw output attached.
    #[error("unparsable probing output: {source}; raw: {output}")]
    Parse {
        source: serde_json::Error,
        output: String,
    },

    /// The request payload could not be encoded.
    #[error("payload encoding failed: {0}")]
    Encode(serde_json::Error),
}

/// Invocation mode, serialized as the `event_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    Poll,
    Discover,
}

/// Immutable snapshot handed to the program in poll mode.
///
/// Built from a poll request plus its resolved profile; the request's
/// timestamp and credential-profile id are deliberately absent; the program
/// needs neither.
#[derive(Debug, Clone, Serialize)]
pub struct PollPayload {
    pub event_type: PluginMode,
    pub ip: String,
    pub port: u16,
    pub device_type: DeviceType,
    pub metric_group: String,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub secrets: CredentialSecrets,
}

impl PollPayload {
    pub fn new(request: &PollRequest, profile: CredentialProfile) -> Self {
        Self {
            event_type: PluginMode::Poll,
            ip: request.ip.clone(),
            port: request.port,
            device_type: request.device_type,
            metric_group: request.group.clone(),
            protocol: profile.protocol,
            secrets: profile.secrets,
        }
    }
}

/// Snapshot handed to the program in discover mode: the candidate address
/// plus every candidate profile record, in the order they should be tried.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverPayload {
    pub event_type: PluginMode,
    pub ip: String,
    pub port: u16,
    pub device_type: DeviceType,
    pub credential_profiles: Vec<CredentialProfile>,
}

/// Discover-mode reply.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverReply {
    #[serde(rename = "credential.profile.id")]
    pub profile_id: Option<EntityId>,
    pub hostname: Option<String>,
    pub status: Option<String>,
}

/// Plugin executable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Path to the probing executable.
    pub path: PathBuf,

    /// Budget for one poll invocation.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Budget for one discover invocation.
    #[serde(with = "humantime_serde")]
    pub discover_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            path: default_plugin_path(),
            poll_timeout: default_poll_timeout(),
            discover_timeout: default_discover_timeout(),
        }
    }
}

/// Handle to the probing executable.
#[derive(Debug, Clone)]
pub struct Plugin {
    path: PathBuf,
    poll_timeout: Duration,
    discover_timeout: Duration,
}

impl Plugin {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            path: config.path.clone(),
            poll_timeout: config.poll_timeout,
            discover_timeout: config.discover_timeout,
        }
    }

    /// Set the poll budget.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the discover budget.
    pub fn with_discover_timeout(mut self, timeout: Duration) -> Self {
        self.discover_timeout = timeout;
        self
    }

    /// Run the program in poll mode and parse its metric result.
    pub async fn poll(&self, payload: &PollPayload) -> Result<Value, PluginError> {
        let payload = serde_json::to_string(payload).map_err(PluginError::Encode)?;
        let stdout = self.invoke(payload, self.poll_timeout).await?;
        serde_json::from_str(stdout.trim()).map_err(|source| PluginError::Parse {
            source,
            output: stdout,
        })
    }

    /// Run the program in discover mode and parse the credential verdict.
    pub async fn discover(&self, payload: &DiscoverPayload) -> Result<DiscoverReply, PluginError> {
        let payload = serde_json::to_string(payload).map_err(PluginError::Encode)?;
        let stdout = self.invoke(payload, self.discover_timeout).await?;
        serde_json::from_str(stdout.trim()).map_err(|source| PluginError::Parse {
            source,
            output: stdout,
        })
    }

    async fn invoke(&self, payload: String, budget: Duration) -> Result<String, PluginError> {
        let child = Command::new(&self.path)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match timeout(budget, child.wait_with_output()).await {
            Ok(result) => result?,
            // Dropping the wait future terminates the child (kill_on_drop).
            Err(_) => return Err(PluginError::Timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let mut combined = stdout;
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(PluginError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                output: combined.trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_plugin(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("plugin.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn ssh_payload() -> PollPayload {
        PollPayload {
            event_type: PluginMode::Poll,
            ip: "10.0.0.5".to_string(),
            port: 22,
            device_type: DeviceType::Linux,
            metric_group: "Linux.CPU".to_string(),
            protocol: Protocol::Ssh,
            secrets: CredentialSecrets::Ssh {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        }
    }

    #[test]
    fn test_poll_payload_has_no_transient_fields() {
        let json = serde_json::to_value(ssh_payload()).unwrap();
        assert_eq!(json["event_type"], "poll");
        assert_eq!(json["metric_group"], "Linux.CPU");
        assert_eq!(json["username"], "admin");
        assert!(json.get("timestamp").is_none());
        assert!(json.get("profile_id").is_none());
    }

    #[tokio::test]
    async fn test_poll_success_parses_stdout() {
        let dir = TempDir::new().unwrap();
        let path = fake_plugin(&dir, r#"echo '{"ip":"10.0.0.5","result":{"cpu":12.5}}'"#);

        let plugin = Plugin::new(path);
        let result = plugin.poll(&ssh_payload()).await.unwrap();
        assert_eq!(result["result"]["cpu"], 12.5);
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_output() {
        let dir = TempDir::new().unwrap();
        let path = fake_plugin(&dir, "echo 'auth failed' >&2; exit 1");

        let plugin = Plugin::new(path);
        let err = plugin.poll(&ssh_payload()).await.unwrap_err();
        match err {
            PluginError::NonZeroExit { status, output } => {
                assert_eq!(status, 1);
                assert!(output.contains("auth failed"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_subprocess() {
        let dir = TempDir::new().unwrap();
        let path = fake_plugin(&dir, "sleep 30; echo '{}'");

        let plugin = Plugin::new(path).with_poll_timeout(Duration::from_millis(200));
        let err = plugin.poll(&ssh_payload()).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout));
    }

    #[tokio::test]
    async fn test_unparsable_stdout_is_attached() {
        let dir = TempDir::new().unwrap();
        let path = fake_plugin(&dir, "echo 'not json at all'");

        let plugin = Plugin::new(path);
        let err = plugin.poll(&ssh_payload()).await.unwrap_err();
        match err {
            PluginError::Parse { output, .. } => assert!(output.contains("not json")),
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discover_reply_parses_dotted_keys() {
        let dir = TempDir::new().unwrap();
        let path = fake_plugin(
            &dir,
            r#"echo '{"credential.profile.id":3,"hostname":"edge-1 ","status":"Up"}'"#,
        );

        let plugin = Plugin::new(path);
        let payload = DiscoverPayload {
            event_type: PluginMode::Discover,
            ip: "10.0.0.5".to_string(),
            port: 161,
            device_type: DeviceType::Snmp,
            credential_profiles: vec![],
        };
        let reply = plugin.discover(&payload).await.unwrap();
        assert_eq!(reply.profile_id, Some(3));
        assert_eq!(reply.hostname.as_deref(), Some("edge-1 "));
        assert_eq!(reply.status.as_deref(), Some("Up"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let plugin = Plugin::new("/nonexistent/probing-program");
        let err = plugin.poll(&ssh_payload()).await.unwrap_err();
        assert!(matches!(err, PluginError::Spawn(_)));
    }
}
