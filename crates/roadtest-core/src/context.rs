//! Immutable per-run execution configuration.
//!
//! An [`ExecutionContext`] is resolved once before a run starts and owned by
//! the orchestrator for the duration of that run. It carries the target
//! platform, the execution mode, the event server configuration, timeouts,
//! the cleanup policy, and (for remote runs) the device cloud credentials.
//!
//! [`ExecutionContext::validate`] performs the fail-fast configuration checks
//! that must reject a run before any resource is acquired: remote mode
//! without credentials, remote mode combined with build-only, and remote mode
//! on a platform without a device cloud capability profile.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Environment variable holding the device cloud username.
pub const CLOUD_USER_VAR: &str = "ROADTEST_CLOUD_USER";

/// Environment variable holding the device cloud access key.
pub const CLOUD_KEY_VAR: &str = "ROADTEST_CLOUD_KEY";

/// Errors produced by configuration validation.
///
/// All of these are detected before any resource acquisition and are never
/// retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Remote mode was requested without both credential variables present.
    #[error("remote mode requires ROADTEST_CLOUD_USER and ROADTEST_CLOUD_KEY to be set")]
    MissingCredentials,

    /// Remote mode was combined with build-only mode.
    #[error("remote mode cannot be combined with build-only mode: there is nothing to wait for")]
    RemoteBuildOnly,

    /// Remote mode was requested for a platform with no capability profile.
    #[error("platform {0} has no device cloud capability profile")]
    UnsupportedRemotePlatform(Platform),

    /// Remote mode was requested but no device cloud endpoints are configured.
    #[error("remote mode requires a device cloud configuration (hub and storage URLs)")]
    MissingCloudConfig,
}

/// Target platform for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
    /// Hybrid-app smoke runs in a local browser. No device cloud profile.
    Browser,
}

impl Platform {
    /// The platform identifier as used on the command line and in URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Browser => "browser",
        }
    }

    /// Whether a device cloud capability profile exists for this platform.
    pub fn has_cloud_profile(&self) -> bool {
        matches!(self, Platform::Android | Platform::Ios)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "browser" => Ok(Platform::Browser),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Execution mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Build the app and report success without waiting for a device.
    BuildOnly,
    /// Run against a local device or emulator.
    RunLocal,
    /// Run against a cloud-hosted remote device.
    RunRemote,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::BuildOnly => "build-only",
            ExecMode::RunLocal => "run-local",
            ExecMode::RunRemote => "run-remote",
        }
    }

    /// Resolve the execution mode from the two caller-facing switches.
    ///
    /// `build_only` and `remote` are independent flags on the command line;
    /// requesting both is a configuration error because a build-only run has
    /// nothing to wait for on a remote device.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::RemoteBuildOnly`] if both switches are set
    pub fn resolve(build_only: bool, remote: bool) -> Result<Self, ConfigError> {
        match (build_only, remote) {
            (true, true) => Err(ConfigError::RemoteBuildOnly),
            (true, false) => Ok(ExecMode::BuildOnly),
            (false, true) => Ok(ExecMode::RunRemote),
            (false, false) => Ok(ExecMode::RunLocal),
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "build-only" => Ok(ExecMode::BuildOnly),
            "run-local" => Ok(ExecMode::RunLocal),
            "run-remote" => Ok(ExecMode::RunRemote),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Device cloud credentials, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    pub username: String,
    pub access_key: String,
}

impl CloudCredentials {
    /// Read credentials from [`CLOUD_USER_VAR`] and [`CLOUD_KEY_VAR`].
    ///
    /// Returns `None` unless both variables are set and non-empty.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(CLOUD_USER_VAR).ok().filter(|v| !v.is_empty())?;
        let access_key = std::env::var(CLOUD_KEY_VAR).ok().filter(|v| !v.is_empty())?;
        Some(Self {
            username,
            access_key,
        })
    }
}

/// Immutable configuration for one orchestration run.
///
/// Constructed by the caller (typically the CLI), validated once, and then
/// owned exclusively by the orchestrator. The working directory is an
/// explicit field here; there is no process-global cached directory.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Target platform.
    pub platform: Platform,

    /// Execution mode.
    pub mode: ExecMode,

    /// Port for the local test event server. Port 0 picks an ephemeral port.
    pub port: u16,

    /// Externally reachable URL base for the event server (e.g. a tunnel).
    /// When set, it is written into the connection file instead of the
    /// locally derived address.
    pub external_url: Option<String>,

    /// How long to wait for a device to attach to the event server.
    pub connection_timeout: Duration,

    /// Overall run timeout; expiry abandons the in-flight stage.
    pub run_timeout: Duration,

    /// Delete the scaffolded project after a passing run.
    pub cleanup_on_success: bool,

    /// Delete the scaffolded project after a failing run.
    pub cleanup_on_failure: bool,

    /// Device cloud credentials; presence is required for remote mode.
    pub credentials: Option<CloudCredentials>,

    /// Directory in which the disposable project is scaffolded.
    pub workspace_dir: PathBuf,

    /// Application identifier used for scaffolding and cloud capabilities.
    pub app_id: String,

    /// Build tool program invoked for scaffold/build/run commands.
    pub build_tool: String,

    /// Stream tool output instead of capturing it.
    pub verbose: bool,
}

impl ExecutionContext {
    /// Create a context with defaults suitable for a local run.
    pub fn new(platform: Platform, mode: ExecMode, workspace_dir: PathBuf) -> Self {
        Self {
            platform,
            mode,
            port: 8008,
            external_url: None,
            connection_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(900),
            cleanup_on_success: true,
            cleanup_on_failure: true,
            credentials: None,
            workspace_dir,
            app_id: "io.roadtest.app".to_string(),
            build_tool: "cordova".to_string(),
            verbose: false,
        }
    }

    /// Fail-fast precondition checks, run before any resource is acquired.
    ///
    /// The build-only/remote incompatibility is rejected earlier, in
    /// [`ExecMode::resolve`], before a context can even be constructed.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnsupportedRemotePlatform`] if the platform has no cloud profile
    /// - [`ConfigError::MissingCredentials`] if remote mode lacks credentials
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == ExecMode::RunRemote {
            if !self.platform.has_cloud_profile() {
                return Err(ConfigError::UnsupportedRemotePlatform(self.platform));
            }
            if self.credentials.is_none() {
                return Err(ConfigError::MissingCredentials);
            }
        }
        Ok(())
    }
}
