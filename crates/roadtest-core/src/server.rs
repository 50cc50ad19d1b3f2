//! Local test event server.
//!
//! The device-side harness dials back to this server over TCP and reports
//! lifecycle events as newline-delimited JSON (see [`crate::protocol`]). The
//! orchestrator consumes three things from it:
//!
//! - the **connection state**: a two-valued fact ("device attached" / "not
//!   yet attached") that transitions exactly once and never reverts, exposed
//!   as a predicate and as a `watch` channel for the connection watchdog;
//! - the **event stream**: every parsed harness event fans out through a
//!   broadcast channel to zero or more subscribers (reporters, log
//!   listeners);
//! - the **suite outcome**: an explicit three-state watcher
//!   (`waiting` / `completed` / `disconnected`) driven by whichever of the
//!   terminal event or a disconnect arrives first.
//!   [`EventServer::wait_for_result`] is the single suspension point that
//!   observes it.
//!
//! Exactly one device session is accepted per server; later connection
//! attempts are refused. The accept loop and the per-device reader are both
//! guarded by a `CancellationToken` that fires on [`EventServer::shutdown`]
//! or drop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::Platform;
use crate::protocol::{HarnessEvent, SpecResults};

/// Capacity of the event broadcast channel. Slow subscribers may lag and
/// miss events; the suite outcome does not depend on the broadcast path.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur while serving or waiting on the event stream.
#[derive(Error, Debug)]
pub enum ServerError {
    /// An I/O error occurred (bind, accept, read).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The device dropped its connection before reporting a terminal event.
    #[error("device disconnected before reporting a result")]
    DeviceDisconnected,

    /// The server shut down while a caller was still waiting for a result.
    #[error("event server closed while waiting for a result")]
    Closed,
}

/// Configuration for [`EventServer::bind`].
#[derive(Debug, Clone)]
pub struct EventServerConfig {
    /// Port to listen on. Port 0 picks an ephemeral port.
    pub port: u16,
    /// Externally reachable URL base (e.g. a tunnel) to hand to the device
    /// instead of the locally derived address.
    pub external_url: Option<String>,
}

impl Default for EventServerConfig {
    fn default() -> Self {
        Self {
            port: 8008,
            external_url: None,
        }
    }
}

/// Events fanned out to subscribers as the run progresses.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The device harness attached.
    Connected { peer: SocketAddr },
    /// A parsed harness event.
    Harness(HarnessEvent),
    /// The device connection closed.
    Disconnected,
}

/// The suite outcome state machine: the first of "terminal event" or
/// "disconnect" drives the only transition out of `Waiting`.
#[derive(Debug, Clone)]
enum SuiteState {
    Waiting,
    Completed(SpecResults),
    Disconnected,
}

/// TCP server consumed by the orchestrator while a run is in flight.
pub struct EventServer {
    local_addr: SocketAddr,
    external_url: Option<String>,
    event_tx: broadcast::Sender<ServerEvent>,
    connected_rx: watch::Receiver<bool>,
    outcome_rx: watch::Receiver<SuiteState>,
    cancel: CancellationToken,
}

impl EventServer {
    /// Bind the listener and start accepting the device connection.
    ///
    /// Binds `0.0.0.0` so a device or emulator on the local network can dial
    /// back.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Io`] if the port cannot be bound
    pub async fn bind(config: EventServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(SuiteState::Waiting);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            event_tx.clone(),
            Arc::new(connected_tx),
            Arc::new(outcome_tx),
            cancel.clone(),
        ));

        info!(%local_addr, "test event server listening");

        Ok(Self {
            local_addr,
            external_url: config.external_url,
            event_tx,
            connected_rx,
            outcome_rx,
            cancel,
        })
    }

    /// The port the server is actually listening on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The URL the device-side harness should dial back to.
    ///
    /// Uses the configured external URL base when present, otherwise the
    /// LAN-reachable address of this host.
    pub fn connection_url(&self, platform: Platform) -> String {
        match &self.external_url {
            Some(base) => format!("{}/?platform={}", base.trim_end_matches('/'), platform),
            None => format!(
                "tcp://{}:{}/?platform={}",
                lan_ip(),
                self.local_addr.port(),
                platform
            ),
        }
    }

    /// Whether a device has attached at any point during this run.
    ///
    /// Transitions once from `false` to `true` and never reverts; a later
    /// disconnect is reported as an event, not as a state reversal.
    pub fn is_device_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// A `watch` view of the connection state, for the watchdog.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Subscribe to the event stream.
    ///
    /// Any number of subscribers may attach; each receives every event from
    /// the moment of subscription. Subscribers that lag too far behind may
    /// miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Wait for the suite outcome.
    ///
    /// Suspends until the state machine leaves `Waiting`: a terminal
    /// `jasmineDone` event yields the spec results, a disconnect before any
    /// terminal event is a hard failure. The transition happens at most once
    /// per run, so this method may be called at any point after [`bind`]
    /// without missing an earlier result.
    ///
    /// [`bind`]: EventServer::bind
    ///
    /// # Errors
    ///
    /// - [`ServerError::DeviceDisconnected`] if the device dropped first
    /// - [`ServerError::Closed`] if the server shut down while waiting
    pub async fn wait_for_result(&self) -> Result<SpecResults, ServerError> {
        let mut rx = self.outcome_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                SuiteState::Waiting => {
                    rx.changed().await.map_err(|_| ServerError::Closed)?;
                }
                SuiteState::Completed(results) => return Ok(results),
                SuiteState::Disconnected => return Err(ServerError::DeviceDisconnected),
            }
        }
    }

    /// Stop accepting and reading. Idempotent; also triggered on drop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for EventServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventServer")
            .field("local_addr", &self.local_addr)
            .field("external_url", &self.external_url)
            .field("connected", &self.is_device_connected())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    event_tx: broadcast::Sender<ServerEvent>,
    connected_tx: Arc<watch::Sender<bool>>,
    outcome_tx: Arc<watch::Sender<SuiteState>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if *connected_tx.borrow() {
                        // Exactly one device session per run.
                        warn!(%peer, "refusing extra device connection");
                        continue;
                    }
                    connected_tx.send_replace(true);
                    info!(%peer, "device attached");
                    let _ = event_tx.send(ServerEvent::Connected { peer });
                    tokio::spawn(handle_device(
                        stream,
                        event_tx.clone(),
                        outcome_tx.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_device(
    stream: TcpStream,
    event_tx: broadcast::Sender<ServerEvent>,
    outcome_tx: Arc<watch::Sender<SuiteState>>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_line(&mut line) => match read {
                Ok(0) => break, // device closed the connection
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match HarnessEvent::parse_line(trimmed) {
                        Ok(event) => {
                            if let HarnessEvent::JasmineDone { spec_results } = &event {
                                transition(&outcome_tx, SuiteState::Completed(spec_results.clone()));
                            }
                            let _ = event_tx.send(ServerEvent::Harness(event));
                        }
                        Err(e) => {
                            debug!(error = %e, line = trimmed, "skipping unparsable event line");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "device read failed");
                    break;
                }
            }
        }
    }

    // A drop before the terminal event is a hard failure; a drop after it
    // leaves the completed outcome untouched.
    transition(&outcome_tx, SuiteState::Disconnected);
    let _ = event_tx.send(ServerEvent::Disconnected);
}

/// First transition out of `Waiting` wins; everything after is a no-op.
fn transition(outcome_tx: &watch::Sender<SuiteState>, next: SuiteState) {
    outcome_tx.send_if_modified(|state| {
        if matches!(state, SuiteState::Waiting) {
            *state = next.clone();
            true
        } else {
            false
        }
    });
}

/// Best-effort LAN address of this host. The UDP connect never sends a
/// packet; it only selects the outbound interface.
fn lan_ip() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(("8.8.8.8", 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    async fn ephemeral_server() -> EventServer {
        EventServer::bind(EventServerConfig {
            port: 0,
            external_url: None,
        })
        .await
        .expect("bind on port 0")
    }

    async fn connect(server: &EventServer) -> TcpStream {
        TcpStream::connect(("127.0.0.1", server.port()))
            .await
            .expect("connect to event server")
    }

    async fn wait_connected(server: &EventServer) {
        let mut watch = server.connected_watch();
        timeout(Duration::from_secs(2), async {
            while !*watch.borrow_and_update() {
                watch.changed().await.expect("server alive");
            }
        })
        .await
        .expect("device should attach");
    }

    #[tokio::test]
    async fn connection_state_flips_on_attach() {
        let server = ephemeral_server().await;
        assert!(!server.is_device_connected());

        let _device = connect(&server).await;
        wait_connected(&server).await;
        assert!(server.is_device_connected());
    }

    #[tokio::test]
    async fn connection_state_never_reverts_after_disconnect() {
        let server = ephemeral_server().await;
        let mut events = server.subscribe();

        let device = connect(&server).await;
        wait_connected(&server).await;
        drop(device);

        // Drain until we see the disconnect event.
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Disconnected) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed early: {}", e),
                }
            }
        })
        .await
        .expect("disconnect event");

        assert!(server.is_device_connected());
    }

    #[tokio::test]
    async fn harness_events_are_broadcast() {
        let server = ephemeral_server().await;
        let mut events = server.subscribe();

        let mut device = connect(&server).await;
        device
            .write_all(b"{\"event\":\"specStarted\",\"description\":\"boots\"}\n")
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.expect("stream open") {
                    ServerEvent::Harness(event) => return event,
                    _ => continue,
                }
            }
        })
        .await
        .expect("harness event");

        assert!(matches!(event, HarnessEvent::SpecStarted { .. }));
    }

    #[tokio::test]
    async fn terminal_event_resolves_result() {
        let server = ephemeral_server().await;

        let mut device = connect(&server).await;
        device
            .write_all(b"{\"event\":\"jasmineDone\",\"specResults\":{\"specFailed\":2,\"specPassed\":5}}\n")
            .await
            .unwrap();

        let results = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time")
            .expect("terminal event");
        assert_eq!(results.spec_failed, 2);
        assert_eq!(results.spec_passed, Some(5));
        assert!(!results.passed());
    }

    #[tokio::test]
    async fn disconnect_before_terminal_is_a_hard_failure() {
        let server = ephemeral_server().await;

        let mut device = connect(&server).await;
        device
            .write_all(b"{\"event\":\"specStarted\"}\n")
            .await
            .unwrap();
        drop(device);

        let result = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time");
        assert!(matches!(result, Err(ServerError::DeviceDisconnected)));
    }

    #[tokio::test]
    async fn disconnect_after_terminal_keeps_the_result() {
        let server = ephemeral_server().await;

        let mut device = connect(&server).await;
        device
            .write_all(b"{\"event\":\"jasmineDone\",\"specResults\":{\"specFailed\":0}}\n")
            .await
            .unwrap();
        device.flush().await.unwrap();

        // Let the terminal event land before dropping the connection.
        let results = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time")
            .expect("terminal event wins");
        drop(device);
        assert!(results.passed());

        // The outcome is stable after the disconnect as well.
        let again = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time")
            .expect("outcome unchanged");
        assert_eq!(again.spec_failed, 0);
    }

    #[tokio::test]
    async fn unparsable_lines_are_skipped() {
        let server = ephemeral_server().await;

        let mut device = connect(&server).await;
        device.write_all(b"garbage that is not json\n").await.unwrap();
        device
            .write_all(b"{\"event\":\"jasmineDone\",\"specResults\":{\"specFailed\":0}}\n")
            .await
            .unwrap();

        let results = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time")
            .expect("terminal event after garbage");
        assert!(results.passed());
    }

    #[tokio::test]
    async fn extra_connections_are_refused() {
        let server = ephemeral_server().await;

        let mut first = connect(&server).await;
        wait_connected(&server).await;

        let mut second = connect(&server).await;
        // The server accepts and immediately drops the extra connection.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("read returns")
            .expect("clean close");
        assert_eq!(n, 0);

        // The first connection still drives the outcome.
        first
            .write_all(b"{\"event\":\"jasmineDone\",\"specResults\":{\"specFailed\":0}}\n")
            .await
            .unwrap();
        let results = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("result in time")
            .expect("first connection wins");
        assert!(results.passed());
    }

    #[tokio::test]
    async fn shutdown_closes_pending_waits() {
        let server = ephemeral_server().await;
        server.shutdown();

        let result = timeout(Duration::from_secs(2), server.wait_for_result())
            .await
            .expect("wait returns after shutdown");
        assert!(matches!(result, Err(ServerError::Closed)));
    }

    #[tokio::test]
    async fn connection_url_uses_external_base_when_configured() {
        let server = EventServer::bind(EventServerConfig {
            port: 0,
            external_url: Some("https://tunnel.example.com/".to_string()),
        })
        .await
        .unwrap();

        assert_eq!(
            server.connection_url(Platform::Android),
            "https://tunnel.example.com/?platform=android"
        );
    }

    #[tokio::test]
    async fn connection_url_derives_local_address() {
        let server = ephemeral_server().await;
        let url = server.connection_url(Platform::Ios);
        assert!(url.starts_with("tcp://"), "got: {}", url);
        assert!(url.contains(&format!(":{}", server.port())), "got: {}", url);
        assert!(url.ends_with("/?platform=ios"), "got: {}", url);
    }
}
