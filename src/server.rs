//! Management API.
//!
//! JSON HTTP surface for operating the registry: credential-profile and
//! discovery-candidate CRUD, running a discovery, and provisioning a
//! verified candidate. Handlers stay thin: validation here, semantics in
//! the prober, provisioning and registry modules.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::prober::{ProbeError, Prober};
use crate::provision::{ProvisionError, provision};
use crate::registry::{
    CredentialProfile, CredentialSecrets, DeviceStatus, DeviceType, DiscoveryCandidate, EntityId,
    Protocol, Registry, RegistryError, StoreError,
};
use crate::scheduler::ProvisionEvent;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub prober: Arc<Prober>,
    pub provision_tx: mpsc::Sender<ProvisionEvent>,
}

/// API failure mapped to a status code and a JSON error body.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Unreachable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Validation(msg) | Self::Unreachable(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Management operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } | RegistryError::Store(StoreError::NotFound { .. }) => {
                Self::NotFound(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ProbeError> for ApiError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::DeviceDown | ProbeError::PortClosed => Self::Unreachable(err.to_string()),
            ProbeError::Registry(e) => e.into(),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::AlreadyProvisioned(_) => Self::Conflict(err.to_string()),
            ProvisionError::NotVerified => Self::Validation(err.to_string()),
            ProvisionError::Registry(e) => e.into(),
        }
    }
}

// =============================================================================
// Request bodies
// =============================================================================

/// Credential profile create/update body.
#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub name: String,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub secrets: CredentialSecrets,
}

impl CredentialRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::Validation("profile name is required".to_string()));
        }
        if self.secrets.protocol() != self.protocol {
            return Err(ApiError::Validation(format!(
                "{} profiles require {} fields",
                self.protocol,
                match self.protocol {
                    Protocol::Ssh => "username/password",
                    Protocol::Snmp => "community/version",
                }
            )));
        }
        let fields = match &self.secrets {
            CredentialSecrets::Ssh { username, password } => [username, password],
            CredentialSecrets::Snmp { community, version } => [community, version],
        };
        if fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ApiError::Validation(
                "credential fields must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Discovery candidate create/update body.
#[derive(Debug, Deserialize)]
pub struct DiscoveryRequest {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub device_type: DeviceType,
    pub credential_profiles: Vec<EntityId>,
}

impl DiscoveryRequest {
    fn validate(&self, registry: &Registry) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::Validation(
                "discovery name is required".to_string(),
            ));
        }
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(ApiError::Validation(format!(
                "invalid address: '{}'",
                self.ip
            )));
        }
        if self.port == 0 {
            return Err(ApiError::Validation("port must be non-zero".to_string()));
        }
        if self.credential_profiles.is_empty() {
            return Err(ApiError::Validation(
                "at least one credential profile is required".to_string(),
            ));
        }
        for id in &self.credential_profiles {
            registry
                .credential(*id)
                .map_err(|_| ApiError::Validation(format!("unknown credential profile: {id}")))?;
        }
        Ok(())
    }
}

/// Identifier reply for create operations.
#[derive(Debug, Serialize)]
struct CreatedResponse {
    id: EntityId,
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all management routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/api/credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/api/credentials/{id}",
            get(get_credential)
                .put(update_credential)
                .delete(delete_credential),
        )
        .route(
            "/api/discoveries",
            get(list_discoveries).post(create_discovery),
        )
        .route(
            "/api/discoveries/{id}",
            get(get_discovery)
                .put(update_discovery)
                .delete(delete_discovery),
        )
        .route("/api/discoveries/{id}/run", post(run_discovery))
        .route("/api/provision/{id}", post(provision_device))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// =============================================================================
// Credential handlers
// =============================================================================

async fn create_credential(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialRequest>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate()?;
    if state.registry.credential_name_taken(&body.name, None) {
        return Err(ApiError::Conflict(format!(
            "credential profile '{}' already exists",
            body.name
        )));
    }

    let profile = state
        .registry
        .insert_credential(CredentialProfile {
            id: 0,
            name: body.name,
            protocol: body.protocol,
            secrets: body.secrets,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: profile.id })))
}

async fn list_credentials(State(state): State<Arc<AppState>>) -> Json<Vec<CredentialProfile>> {
    Json(state.registry.credentials())
}

async fn get_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<CredentialProfile>, ApiError> {
    Ok(Json(state.registry.credential(id)?))
}

async fn update_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
    Json(body): Json<CredentialRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate()?;
    state.registry.credential(id)?;
    if state.registry.credential_name_taken(&body.name, Some(id)) {
        return Err(ApiError::Conflict(format!(
            "credential profile '{}' already exists",
            body.name
        )));
    }

    state
        .registry
        .update_credential(CredentialProfile {
            id,
            name: body.name,
            protocol: body.protocol,
            secrets: body.secrets,
        })
        .await?;
    Ok(StatusCode::OK)
}

async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove_credential(id).await?;
    Ok(StatusCode::OK)
}

// =============================================================================
// Discovery handlers
// =============================================================================

async fn create_discovery(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DiscoveryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    body.validate(&state.registry)?;
    if state.registry.discovery_name_taken(&body.name, None) {
        return Err(ApiError::Conflict(format!(
            "discovery '{}' already exists",
            body.name
        )));
    }

    let candidate = state
        .registry
        .insert_discovery(DiscoveryCandidate {
            id: 0,
            name: body.name,
            ip: body.ip,
            port: body.port,
            device_type: body.device_type,
            credential_profiles: body.credential_profiles,
            resolved_profile: None,
            hostname: None,
            status: DeviceStatus::Down,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse { id: candidate.id }),
    ))
}

async fn list_discoveries(State(state): State<Arc<AppState>>) -> Json<Vec<DiscoveryCandidate>> {
    Json(state.registry.discoveries())
}

async fn get_discovery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<DiscoveryCandidate>, ApiError> {
    Ok(Json(state.registry.discovery(id)?))
}

async fn update_discovery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
    Json(body): Json<DiscoveryRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate(&state.registry)?;
    let existing = state.registry.discovery(id)?;
    if state.registry.discovery_name_taken(&body.name, Some(id)) {
        return Err(ApiError::Conflict(format!(
            "discovery '{}' already exists",
            body.name
        )));
    }

    // Probe results stay in place; re-running the discovery refreshes them.
    state
        .registry
        .update_discovery(DiscoveryCandidate {
            id,
            name: body.name,
            ip: body.ip,
            port: body.port,
            device_type: body.device_type,
            credential_profiles: body.credential_profiles,
            resolved_profile: existing.resolved_profile,
            hostname: existing.hostname,
            status: existing.status,
        })
        .await?;
    Ok(StatusCode::OK)
}

async fn delete_discovery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove_discovery(id).await?;
    Ok(StatusCode::OK)
}

async fn run_discovery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<DiscoveryCandidate>, ApiError> {
    let candidate = state.registry.discovery(id)?;
    if state.registry.device_with_ip(&candidate.ip).is_some() {
        return Err(ApiError::Conflict(format!(
            "device with address {} is already provisioned",
            candidate.ip
        )));
    }

    Ok(Json(state.prober.probe(id).await?))
}

// =============================================================================
// Provision handler
// =============================================================================

async fn provision_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<impl IntoResponse, ApiError> {
    let device = provision(&state.registry, &state.provision_tx, id).await?;
    Ok((StatusCode::CREATED, Json(device)))
}
