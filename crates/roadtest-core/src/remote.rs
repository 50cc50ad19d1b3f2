//! Remote device cloud session management.
//!
//! A remote run builds the app locally, uploads the binary to the device
//! cloud's storage (one fixed filename per platform, so re-uploads overwrite
//! in place), and opens exactly one driver session described by a
//! [`Capabilities`] mapping. The cloud device then launches the app, whose
//! harness dials back to the same local event server a local run uses.
//!
//! The cloud itself sits behind the [`DeviceCloud`] trait so tests can stand
//! in a mock; [`RestDeviceCloud`] is the HTTP implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::context::{CloudCredentials, Platform};

/// Errors from upload, provisioning, and release of remote sessions.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The platform has no capability profile for the device cloud.
    #[error("platform {0} has no device cloud capability profile")]
    UnsupportedPlatform(Platform),

    /// The artifact upload was rejected.
    #[error("artifact upload failed: {0}")]
    Upload(String),

    /// The remote driver session could not be started.
    #[error("failed to start remote session: {0}")]
    Provision(String),

    /// The remote driver session could not be terminated.
    #[error("failed to end remote session: {0}")]
    Teardown(String),

    /// A transport-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// An I/O error occurred (e.g. reading the artifact).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Desired-device description sent when opening a session.
///
/// Immutable once constructed; consumed exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub device_name: String,
    pub platform_name: String,
    pub platform_version: String,
    /// Storage reference of the uploaded artifact.
    pub app: String,
    pub device_orientation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Application identifier on the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// Fixed upload filename per platform.
///
/// One name per platform means a re-upload overwrites the previous artifact
/// in place, which keeps the upload idempotent across retried runs.
pub fn artifact_name(platform: Platform) -> Option<&'static str> {
    match platform {
        Platform::Android => Some("roadtest-app.apk"),
        Platform::Ios => Some("roadtest-app.ipa"),
        Platform::Browser => None,
    }
}

/// Build the capability profile for a platform.
///
/// Pure per-platform dispatch; platforms without a profile are rejected.
///
/// # Errors
///
/// - [`RemoteError::UnsupportedPlatform`] for platforms without a profile
pub fn capabilities_for(platform: Platform, app_id: &str) -> Result<Capabilities, RemoteError> {
    let storage_app = |name: &str| format!("storage:filename={}", name);
    match platform {
        Platform::Android => Ok(Capabilities {
            device_name: "Android GoogleAPI Emulator".to_string(),
            platform_name: "Android".to_string(),
            platform_version: "12.0".to_string(),
            app: storage_app("roadtest-app.apk"),
            device_orientation: "portrait".to_string(),
            device_type: None,
            app_id: Some(app_id.to_string()),
        }),
        Platform::Ios => Ok(Capabilities {
            device_name: "iPhone Simulator".to_string(),
            platform_name: "iOS".to_string(),
            platform_version: "16.2".to_string(),
            app: storage_app("roadtest-app.ipa"),
            device_orientation: "portrait".to_string(),
            device_type: Some("phone".to_string()),
            app_id: Some(app_id.to_string()),
        }),
        Platform::Browser => Err(RemoteError::UnsupportedPlatform(platform)),
    }
}

/// Minimal device cloud surface needed by the orchestrator.
#[async_trait]
pub trait DeviceCloud: Send + Sync {
    /// Upload a built artifact, overwriting any previous one with the same
    /// name.
    async fn upload_artifact(&self, filename: &str, bytes: Vec<u8>) -> Result<(), RemoteError>;

    /// Start a driver session and return its id.
    async fn open_session(&self, capabilities: &Capabilities) -> Result<String, RemoteError>;

    /// Terminate a driver session.
    async fn close_session(&self, session_id: &str) -> Result<(), RemoteError>;
}

/// Endpoints and credentials for [`RestDeviceCloud`].
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Driver hub base URL (e.g. `https://hub.example.com/wd/hub`).
    pub hub_url: String,
    /// Storage base URL for artifact uploads.
    pub storage_url: String,
    pub credentials: CloudCredentials,
}

/// HTTP implementation of [`DeviceCloud`].
pub struct RestDeviceCloud {
    http: reqwest::Client,
    config: CloudConfig,
}

impl RestDeviceCloud {
    pub fn new(config: CloudConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn hub_endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.hub_url.trim_end_matches('/'), path)
    }

    fn storage_endpoint(&self, filename: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.storage_url.trim_end_matches('/'),
            self.config.credentials.username,
            filename
        )
    }
}

#[async_trait]
impl DeviceCloud for RestDeviceCloud {
    async fn upload_artifact(&self, filename: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        let url = self.storage_endpoint(filename);
        info!(%url, size = bytes.len(), "uploading artifact");

        let response = self
            .http
            .put(&url)
            .basic_auth(
                &self.config.credentials.username,
                Some(&self.config.credentials.access_key),
            )
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Upload(format!("{}: {}", status, body.trim())));
        }
        Ok(())
    }

    async fn open_session(&self, capabilities: &Capabilities) -> Result<String, RemoteError> {
        let url = self.hub_endpoint("session");
        let response = self
            .http
            .post(&url)
            .basic_auth(
                &self.config.credentials.username,
                Some(&self.config.credentials.access_key),
            )
            .json(&new_session_payload(capabilities))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Provision(format!("{}: {}", status, body.trim())));
        }

        let body: serde_json::Value = response.json().await?;
        parse_session_id(&body)
            .ok_or_else(|| RemoteError::Provision("response carried no session id".to_string()))
    }

    async fn close_session(&self, session_id: &str) -> Result<(), RemoteError> {
        let url = self.hub_endpoint(&format!("session/{}", session_id));
        let response = self
            .http
            .delete(&url)
            .basic_auth(
                &self.config.credentials.username,
                Some(&self.config.credentials.access_key),
            )
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RemoteError::Teardown(response.status().to_string()));
        }
        Ok(())
    }
}

/// New-session request body, with both current and legacy capability keys.
fn new_session_payload(capabilities: &Capabilities) -> serde_json::Value {
    serde_json::json!({
        "capabilities": { "alwaysMatch": capabilities },
        "desiredCapabilities": capabilities,
    })
}

/// Extract a session id from either response shape.
fn parse_session_id(body: &serde_json::Value) -> Option<String> {
    body.get("value")
        .and_then(|v| v.get("sessionId"))
        .and_then(|v| v.as_str())
        .or_else(|| body.get("sessionId").and_then(|v| v.as_str()))
        .map(str::to_owned)
}

/// Exactly one remote device session per run.
///
/// Provisioning failure leaves no partial state to clean up. Release is
/// best-effort and idempotent: [`RemoteSession::close`] swallows its own
/// errors so it can never mask the primary run result.
pub struct RemoteSession {
    cloud: Arc<dyn DeviceCloud>,
    session_id: String,
    closed: bool,
}

impl RemoteSession {
    /// Open a session with the given capability profile.
    ///
    /// # Errors
    ///
    /// - Any [`RemoteError`] from the cloud's session endpoint
    pub async fn open(
        cloud: Arc<dyn DeviceCloud>,
        capabilities: &Capabilities,
    ) -> Result<Self, RemoteError> {
        let session_id = cloud.open_session(capabilities).await?;
        info!(%session_id, "remote device session started");
        Ok(Self {
            cloud,
            session_id,
            closed: false,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Terminate the session. Errors are logged, never propagated.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.cloud.close_session(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %e, "failed to end remote session");
        } else {
            info!(session_id = %self.session_id, "remote device session ended");
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                session_id = %self.session_id,
                "remote session dropped without close"
            );
        }
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("session_id", &self.session_id)
            .field("closed", &self.closed)
            .finish()
    }
}
