//! Run orchestration: the ordered pipeline of setup, run, and teardown.
//!
//! One [`Orchestrator`] drives exactly one run at a time:
//!
//! 1. validate the execution context (fail fast, nothing acquired yet);
//! 2. scaffold the disposable project;
//! 3. bind the local test event server;
//! 4. subscribe the passive event listener *before* issuing any tool
//!    command, so early events are not lost;
//! 5. write the connection file the device-side harness reads;
//! 6. branch on the execution mode (build-only short-circuits, local runs
//!    launch on a device/emulator, remote runs upload the artifact and open
//!    a device cloud session), then wait behind the connection watchdog for
//!    the suite outcome;
//! 7. tear down on every exit path: the remote session first, then the
//!    project per the cleanup policy. Teardown runs exactly once and its own
//!    failures are logged, never propagated, so they cannot mask the primary
//!    result.
//!
//! The pipeline body runs under the overall run timeout; expiry abandons the
//! in-flight stage and still reaches teardown. All mutable per-run state
//! lives in [`RunSession`], threaded explicitly through the stages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ConfigError, ExecMode, ExecutionContext};
use crate::project::{Project, ProjectError};
use crate::protocol::{HarnessEvent, SpecResults};
use crate::remote::{artifact_name, capabilities_for, DeviceCloud, RemoteError, RemoteSession};
use crate::server::{EventServer, EventServerConfig, ServerError, ServerEvent};
use crate::tooling::{BuildTool, ToolError};
use crate::watchdog::{ConnectionWatchdog, WatchdogError};

/// Aggregated pass/fail outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    /// `true` exactly when no spec failed.
    pub passed: bool,
    /// Failed-spec count from the terminal event (0 for build-only runs).
    pub spec_failed: u32,
}

impl From<SpecResults> for TestOutcome {
    fn from(results: SpecResults) -> Self {
        Self {
            passed: results.passed(),
            spec_failed: results.spec_failed,
        }
    }
}

/// Top-level failure value for one run.
///
/// Every stage error funnels into one of these; nothing is silently
/// swallowed except teardown-phase errors, which are logged only.
#[derive(Error, Debug)]
pub enum RunError {
    /// Rejected before any resource acquisition.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scaffolding or project cleanup failed.
    #[error("project error: {0}")]
    Project(#[from] ProjectError),

    /// The event server failed, or the device dropped before a result.
    #[error("event server error: {0}")]
    Server(#[from] ServerError),

    /// The build/run tool failed.
    #[error("build tool error: {0}")]
    Tool(#[from] ToolError),

    /// No device attached within the connection timeout.
    #[error("{0}")]
    Watchdog(#[from] WatchdogError),

    /// Upload or remote session provisioning failed.
    #[error("device cloud error: {0}")]
    Remote(#[from] RemoteError),

    /// The overall run timeout expired.
    #[error("run did not complete within {0:?}")]
    RunTimeout(Duration),

    /// A broken pipeline invariant. Indicates a bug, not a bad run.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Mutable state of one orchestration pass.
///
/// Owns every acquired handle; all of them are released exactly once during
/// teardown, on every exit path. Holding at most one live event server and
/// at most one live remote session at a time is an invariant; attaching a
/// second one is a programming error.
pub struct RunSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    project: Option<Project>,
    server: Option<EventServer>,
    remote: Option<RemoteSession>,
    listener: Option<JoinHandle<()>>,
}

impl RunSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            project: None,
            server: None,
            remote: None,
            listener: None,
        }
    }

    /// Short id used in scaffold directory names.
    fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    fn attach_project(&mut self, project: Project) {
        assert!(
            self.project.is_none(),
            "run session already owns a scaffolded project"
        );
        self.project = Some(project);
    }

    fn attach_server(&mut self, server: EventServer) {
        assert!(
            self.server.is_none(),
            "run session already owns a live event server"
        );
        self.server = Some(server);
    }

    fn attach_remote(&mut self, remote: RemoteSession) {
        assert!(
            self.remote.is_none(),
            "run session already owns a live remote session"
        );
        self.remote = Some(remote);
    }

    fn project(&self) -> Result<&Project, RunError> {
        self.project
            .as_ref()
            .ok_or(RunError::Internal("no scaffolded project attached"))
    }

    fn server(&self) -> Result<&EventServer, RunError> {
        self.server
            .as_ref()
            .ok_or(RunError::Internal("no live event server attached"))
    }
}

/// Drives one run end to end.
pub struct Orchestrator {
    context: ExecutionContext,
    cloud: Option<Arc<dyn DeviceCloud>>,
}

impl Orchestrator {
    /// Orchestrator for local and build-only runs.
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            cloud: None,
        }
    }

    /// Orchestrator with a device cloud attached, for remote runs.
    pub fn with_cloud(context: ExecutionContext, cloud: Arc<dyn DeviceCloud>) -> Self {
        Self {
            context,
            cloud: Some(cloud),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run the full pipeline and return the aggregated outcome.
    ///
    /// Teardown executes exactly once before this returns, whether the
    /// pipeline succeeded, failed at any stage, or hit the overall run
    /// timeout.
    ///
    /// # Errors
    ///
    /// The first error encountered by any stage, after teardown completes.
    pub async fn run(&self) -> Result<TestOutcome, RunError> {
        self.context.validate()?;
        if self.context.mode == ExecMode::RunRemote && self.cloud.is_none() {
            return Err(ConfigError::MissingCloudConfig.into());
        }

        let mut session = RunSession::new();
        info!(
            run_id = %session.id,
            platform = %self.context.platform,
            mode = %self.context.mode,
            "starting test run"
        );

        let result =
            match tokio::time::timeout(self.context.run_timeout, self.execute(&mut session)).await
            {
                Ok(result) => result,
                Err(_) => Err(RunError::RunTimeout(self.context.run_timeout)),
            };

        let success = matches!(&result, Ok(outcome) if outcome.passed);
        self.teardown(&mut session, success).await;

        let elapsed_ms = (Utc::now() - session.started_at).num_milliseconds();
        match &result {
            Ok(outcome) => info!(
                run_id = %session.id,
                passed = outcome.passed,
                spec_failed = outcome.spec_failed,
                elapsed_ms,
                "run finished"
            ),
            Err(e) => warn!(run_id = %session.id, error = %e, elapsed_ms, "run failed"),
        }

        result
    }

    async fn execute(&self, session: &mut RunSession) -> Result<TestOutcome, RunError> {
        let ctx = &self.context;

        // The project handle lands in the session immediately so teardown
        // can release it from any later failure point.
        let name = format!("roadtest-{}", session.short_id());
        let project = Project::scaffold(
            &ctx.build_tool,
            &ctx.workspace_dir,
            &name,
            &ctx.app_id,
            ctx.platform,
            ctx.verbose,
        )
        .await?;
        session.attach_project(project);

        let server = EventServer::bind(EventServerConfig {
            port: ctx.port,
            external_url: ctx.external_url.clone(),
        })
        .await?;

        // Listeners subscribe before any tool command is issued so early
        // events are not lost.
        session.listener = Some(spawn_event_listener(server.subscribe()));

        let logurl = server.connection_url(ctx.platform);
        session.attach_server(server);
        session.project()?.write_connection_file(&logurl)?;

        let tool = BuildTool::new(
            ctx.build_tool.as_str(),
            ctx.platform,
            session.project()?.root(),
            ctx.verbose,
        );

        match ctx.mode {
            ExecMode::BuildOnly => {
                tool.build().await?;
                info!("build-only run: reporting success without waiting for a device");
                return Ok(TestOutcome {
                    passed: true,
                    spec_failed: 0,
                });
            }
            ExecMode::RunLocal => {
                tool.run().await?;
            }
            ExecMode::RunRemote => {
                tool.build().await?;
                self.provision_remote(session, &tool).await?;
            }
        }

        let server = session.server()?;
        ConnectionWatchdog::wait(server, ctx.connection_timeout).await?;
        let results = server.wait_for_result().await?;
        Ok(results.into())
    }

    /// Upload the built artifact and open the one remote session of the run.
    async fn provision_remote(
        &self,
        session: &mut RunSession,
        tool: &BuildTool,
    ) -> Result<(), RunError> {
        let ctx = &self.context;
        let cloud = self
            .cloud
            .clone()
            .ok_or(RunError::Internal("remote run without a device cloud"))?;

        let filename =
            artifact_name(ctx.platform).ok_or(RemoteError::UnsupportedPlatform(ctx.platform))?;
        let artifact = tool
            .artifact_path()
            .ok_or(RemoteError::UnsupportedPlatform(ctx.platform))?;
        let bytes = tokio::fs::read(&artifact).await.map_err(RemoteError::Io)?;
        cloud.upload_artifact(filename, bytes).await?;

        let capabilities = capabilities_for(ctx.platform, &ctx.app_id)?;
        let remote = RemoteSession::open(cloud, &capabilities).await?;
        session.attach_remote(remote);
        Ok(())
    }

    /// Release everything the session acquired. Runs exactly once per run;
    /// failures here are logged, never propagated.
    async fn teardown(&self, session: &mut RunSession, success: bool) {
        debug!(run_id = %session.id, "tearing down");

        if let Some(mut remote) = session.remote.take() {
            remote.close().await;
        }
        if let Some(server) = session.server.take() {
            server.shutdown();
        }
        if let Some(listener) = session.listener.take() {
            listener.abort();
        }
        if let Some(project) = session.project.take() {
            let cleanup = if success {
                self.context.cleanup_on_success
            } else {
                self.context.cleanup_on_failure
            };
            if cleanup {
                if let Err(e) = project.remove().await {
                    warn!(error = %e, "failed to remove project during teardown");
                }
            } else {
                info!(path = %project.root().display(), "keeping project for inspection");
            }
        }
    }
}

/// Passive listener: turns the event stream into structured logs. Fire and
/// forget; never affects control flow.
fn spawn_event_listener(mut events: broadcast::Receiver<ServerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Connected { peer }) => info!(%peer, "device reporting in"),
                Ok(ServerEvent::Harness(event)) => log_harness_event(&event),
                Ok(ServerEvent::Disconnected) => debug!("device connection closed"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_harness_event(event: &HarnessEvent) {
    match event {
        HarnessEvent::DeviceLog { line } => info!(target: "roadtest::device", "{}", line),
        HarnessEvent::DeviceInfo { info } => debug!(%info, "device info"),
        HarnessEvent::JasmineStarted => info!("suite started on device"),
        HarnessEvent::SpecDone {
            description,
            status,
        } => debug!(
            spec = description.as_deref().unwrap_or("?"),
            status = status.as_deref().unwrap_or("?"),
            "spec done"
        ),
        HarnessEvent::JasmineDone { spec_results } => {
            info!(spec_failed = spec_results.spec_failed, "suite finished")
        }
        _ => debug!(?event, "lifecycle event"),
    }
}
