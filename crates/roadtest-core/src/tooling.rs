//! Invocation of the platform build/run tool.
//!
//! The orchestrator treats the build tool as an external collaborator: it
//! issues `<tool> build <platform>` and `<tool> run <platform>` in the
//! scaffolded project directory and only looks at the exit status. In
//! verbose mode the tool's output streams straight to the terminal; in quiet
//! mode it is captured and attached to the error on failure, so the output
//! surfaces exactly once either way.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::context::Platform;

/// Errors from build tool invocation.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool exited with a non-zero status.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The tool could not be executed at all.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a tool to completion and check its exit status.
///
/// With `verbose` the child inherits stdout/stderr and the failure message
/// carries only the exit status; otherwise output is captured and the
/// trailing detail is included in the error.
pub(crate) async fn run_checked(
    program: &str,
    args: &[&str],
    cwd: &Path,
    verbose: bool,
) -> Result<(), ToolError> {
    let rendered = format!("{} {}", program, args.join(" "));
    debug!(command = %rendered, cwd = %cwd.display(), "invoking tool");

    let mut command = Command::new(program);
    command.args(args).current_dir(cwd).stdin(Stdio::null());

    if verbose {
        let status = command.status().await?;
        if !status.success() {
            return Err(ToolError::CommandFailed(format!(
                "`{}` exited with {}",
                rendered, status
            )));
        }
    } else {
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(ToolError::CommandFailed(format!(
                "`{}` exited with {}: {}",
                rendered, output.status, detail
            )));
        }
    }

    Ok(())
}

/// Handle for issuing build/run commands against one scaffolded project.
#[derive(Debug, Clone)]
pub struct BuildTool {
    program: String,
    platform: Platform,
    project_dir: PathBuf,
    verbose: bool,
}

impl BuildTool {
    pub fn new(
        program: impl Into<String>,
        platform: Platform,
        project_dir: impl Into<PathBuf>,
        verbose: bool,
    ) -> Self {
        Self {
            program: program.into(),
            platform,
            project_dir: project_dir.into(),
            verbose,
        }
    }

    /// Build the app for the target platform.
    ///
    /// # Errors
    ///
    /// - [`ToolError::CommandFailed`] on a non-zero exit
    /// - [`ToolError::Io`] if the tool cannot be executed
    pub async fn build(&self) -> Result<(), ToolError> {
        run_checked(
            &self.program,
            &["build", self.platform.as_str()],
            &self.project_dir,
            self.verbose,
        )
        .await
    }

    /// Build and launch the app on a local device or emulator.
    ///
    /// The command returns once the app is installed and launched; the test
    /// suite itself reports back through the event server.
    ///
    /// # Errors
    ///
    /// - [`ToolError::CommandFailed`] on a non-zero exit
    /// - [`ToolError::Io`] if the tool cannot be executed
    pub async fn run(&self) -> Result<(), ToolError> {
        run_checked(
            &self.program,
            &["run", self.platform.as_str()],
            &self.project_dir,
            self.verbose,
        )
        .await
    }

    /// Where the built binary lands under the project tree, per platform.
    ///
    /// `None` for platforms that produce no uploadable artifact.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        match self.platform {
            Platform::Android => Some(self.project_dir.join(
                "platforms/android/app/build/outputs/apk/debug/app-debug.apk",
            )),
            Platform::Ios => Some(self.project_dir.join("platforms/ios/build/device/App.ipa")),
            Platform::Browser => None,
        }
    }
}
