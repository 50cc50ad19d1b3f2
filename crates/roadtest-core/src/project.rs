//! Disposable scaffolded-project handle.
//!
//! Scaffolding itself is delegated to the external build tool (`<tool>
//! create`, `<tool> platform add`); this module owns the resulting directory
//! for the lifetime of one run, writes the connection file the device-side
//! harness reads to find the event server, and deletes the tree during
//! teardown when the cleanup policy asks for it.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::context::Platform;
use crate::tooling::{run_checked, ToolError};

/// File written into the project root for the device-side harness.
pub const CONNECTION_FILENAME: &str = "roadtest.json";

/// Errors from project scaffolding and cleanup.
#[derive(Error, Debug)]
pub enum ProjectError {
    /// A scaffold command exited non-zero or could not be executed.
    #[error("failed to scaffold project: {0}")]
    ScaffoldFailed(String),

    /// An I/O error occurred while managing the project tree.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize the connection file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle to one scaffolded project directory.
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// Create the project directory and run the external scaffold commands.
    ///
    /// # Errors
    ///
    /// - [`ProjectError::Io`] if the directories cannot be created
    /// - [`ProjectError::ScaffoldFailed`] if a scaffold command fails
    pub async fn scaffold(
        tool: &str,
        workspace_dir: &Path,
        name: &str,
        app_id: &str,
        platform: Platform,
        verbose: bool,
    ) -> Result<Self, ProjectError> {
        tokio::fs::create_dir_all(workspace_dir).await?;
        let root = workspace_dir.join(name);
        tokio::fs::create_dir_all(&root).await?;

        let root_arg = root.to_string_lossy().into_owned();
        run_checked(tool, &["create", &root_arg, app_id, name], workspace_dir, verbose)
            .await
            .map_err(scaffold_err)?;
        run_checked(tool, &["platform", "add", platform.as_str()], &root, verbose)
            .await
            .map_err(scaffold_err)?;

        info!(path = %root.display(), "project scaffolded");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the connection file inside the project.
    pub fn connection_file(&self) -> PathBuf {
        self.root.join(CONNECTION_FILENAME)
    }

    /// Persist `{"logurl": …}` so the harness knows where to report events.
    ///
    /// # Errors
    ///
    /// - [`ProjectError::Io`] if the file cannot be written
    pub fn write_connection_file(&self, logurl: &str) -> Result<(), ProjectError> {
        let payload = serde_json::json!({ "logurl": logurl });
        std::fs::write(self.connection_file(), serde_json::to_string_pretty(&payload)?)?;
        debug!(logurl, path = %self.connection_file().display(), "connection file written");
        Ok(())
    }

    /// Delete the project tree. Consumes the handle.
    ///
    /// # Errors
    ///
    /// - [`ProjectError::Io`] if the tree cannot be removed
    pub async fn remove(self) -> Result<(), ProjectError> {
        tokio::fs::remove_dir_all(&self.root).await?;
        info!(path = %self.root.display(), "project removed");
        Ok(())
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project").field("root", &self.root).finish()
    }
}

fn scaffold_err(e: ToolError) -> ProjectError {
    ProjectError::ScaffoldFailed(e.to_string())
}
