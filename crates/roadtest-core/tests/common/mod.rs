//! Shared test helpers for roadtest-core integration tests.
//!
//! Provides a fake platform tool (a shell script standing in for the real
//! build CLI), a scripted fake device that dials back to the event server
//! the way a real harness would, and a mock device cloud.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use roadtest_core::remote::{Capabilities, DeviceCloud, RemoteError};

// ---------------------------------------------------------------------------
// Fake platform tool
// ---------------------------------------------------------------------------

/// Write an executable shell script that stands in for the platform tool.
///
/// `create` and `platform add` are no-ops; `build` drops a fake Android apk
/// where [`BuildTool::artifact_path`] expects it, relative to the current
/// working directory (the project root).
///
/// [`BuildTool::artifact_path`]: roadtest_core::tooling::BuildTool::artifact_path
pub fn fake_tool(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-tool.sh");
    let script = "#!/bin/sh\n\
        case \"$1\" in\n\
          build)\n\
            mkdir -p platforms/android/app/build/outputs/apk/debug\n\
            printf 'apk-bytes' > platforms/android/app/build/outputs/apk/debug/app-debug.apk\n\
            ;;\n\
        esac\n\
        exit 0\n";
    std::fs::write(&path, script).expect("write fake tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("mark fake tool executable");
    path
}

// ---------------------------------------------------------------------------
// Scripted fake device
// ---------------------------------------------------------------------------

/// What the fake device does once it has dialed back.
pub enum DeviceBehavior {
    /// Connect, report a running suite, and finish with the given count.
    ReportAndFinish { spec_failed: u32 },
    /// Connect, start a spec, then drop without a terminal event.
    ConnectAndDrop,
}

/// Play the device side of a run: wait for the orchestrator to write the
/// connection file into the scaffolded project, dial the event server, and
/// act out `behavior`.
///
/// Panics if no connection file appears within ten seconds.
pub async fn run_device(workspace: PathBuf, behavior: DeviceBehavior) {
    let logurl = wait_for_logurl(&workspace).await;
    let addr = addr_from_logurl(&logurl);
    let mut stream = TcpStream::connect(addr).await.expect("dial event server");

    match behavior {
        DeviceBehavior::ReportAndFinish { spec_failed } => {
            stream
                .write_all(b"{\"event\":\"jasmineStarted\"}\n")
                .await
                .unwrap();
            stream
                .write_all(b"{\"event\":\"deviceLog\",\"line\":\"suite running\"}\n")
                .await
                .unwrap();
            stream
                .write_all(
                    format!(
                        "{{\"event\":\"jasmineDone\",\"specResults\":{{\"specFailed\":{}}}}}\n",
                        spec_failed
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            stream.flush().await.unwrap();
        }
        DeviceBehavior::ConnectAndDrop => {
            stream
                .write_all(b"{\"event\":\"specStarted\",\"description\":\"boots\"}\n")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            // Dropping the stream here is the abnormal disconnect.
        }
    }
}

/// Poll the workspace for the scaffolded project's connection file.
async fn wait_for_logurl(workspace: &Path) -> String {
    for _ in 0..400 {
        if let Some(url) = try_read_logurl(workspace) {
            return url;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no connection file appeared under {}", workspace.display());
}

fn try_read_logurl(workspace: &Path) -> Option<String> {
    for entry in std::fs::read_dir(workspace).ok()? {
        let path = entry.ok()?.path().join("roadtest.json");
        if let Ok(content) = std::fs::read_to_string(&path) {
            let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
            return parsed["logurl"].as_str().map(str::to_owned);
        }
    }
    None
}

/// Extract `host:port` from a `tcp://host:port/?platform=...` URL.
fn addr_from_logurl(logurl: &str) -> SocketAddr {
    let rest = logurl
        .strip_prefix("tcp://")
        .unwrap_or_else(|| panic!("unexpected logurl scheme: {}", logurl));
    let host_port = rest.split('/').next().unwrap_or(rest);
    host_port
        .parse()
        .unwrap_or_else(|e| panic!("bad logurl address {}: {}", host_port, e))
}

// ---------------------------------------------------------------------------
// Mock device cloud
// ---------------------------------------------------------------------------

/// Records uploads and session calls; optionally fails provisioning.
pub struct MockCloud {
    pub uploads: Mutex<Vec<(String, usize)>>,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub fail_open: bool,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_open: false,
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl DeviceCloud for MockCloud {
    async fn upload_artifact(&self, filename: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        self.uploads
            .lock()
            .unwrap()
            .push((filename.to_string(), bytes.len()));
        Ok(())
    }

    async fn open_session(&self, _: &Capabilities) -> Result<String, RemoteError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            Err(RemoteError::Provision("no devices available".to_string()))
        } else {
            Ok("mock-session".to_string())
        }
    }

    async fn close_session(&self, _: &str) -> Result<(), RemoteError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
