//! Bridge worker (C6) — the core dataplane.
//!
//! Each link owns two TCP listeners. The accept order is A-then-Z; once both
//! sides are connected, bytes are spliced in both directions with per-byte
//! counters, and the worker loops back to accept the next session (this is
//! how VM reboots are tolerated without the process restarting).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{LabError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeLinkConfig {
    pub a: String,
    pub z: String,
    pub a_port: u16,
    pub z_port: u16,
    pub a_bind: String,
    pub z_bind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub links: Vec<BridgeLinkConfig>,
    #[serde(default)]
    pub stats_addr: String,
}

#[derive(Debug, Default)]
pub struct LinkCounters {
    pub a_to_z_bytes: AtomicU64,
    pub z_to_a_bytes: AtomicU64,
    pub sessions: AtomicU64,
    pub connected: AtomicBool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStats {
    pub a: String,
    pub z: String,
    pub a_port: u16,
    pub z_port: u16,
    pub a_to_z_bytes: u64,
    pub z_to_a_bytes: u64,
    pub sessions: u64,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub links: Vec<LinkStats>,
}

struct LinkRuntime {
    config: BridgeLinkConfig,
    counters: Arc<LinkCounters>,
    task: JoinHandle<()>,
}

/// A running bridge process's link workers plus a live stats registry.
pub struct RunningBridge {
    links: Vec<LinkRuntime>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningBridge {
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            links: self
                .links
                .iter()
                .map(|l| LinkStats {
                    a: l.config.a.clone(),
                    z: l.config.z.clone(),
                    a_port: l.config.a_port,
                    z_port: l.config.z_port,
                    a_to_z_bytes: l.counters.a_to_z_bytes.load(Ordering::SeqCst),
                    z_to_a_bytes: l.counters.z_to_a_bytes.load(Ordering::SeqCst),
                    sessions: l.counters.sessions.load(Ordering::SeqCst),
                    connected: l.counters.connected.load(Ordering::SeqCst),
                })
                .collect(),
        }
    }

    /// Close listeners and wait for every link task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for link in self.links {
            let _ = link.task.await;
        }
    }
}

fn parse_bind(bind: &str, port: u16) -> String {
    format!("{bind}:{port}")
}

/// Bind every link's pair of listeners and start the accept/splice loop.
/// Listener-open failure is fatal: every previously opened listener is
/// dropped (closing its socket) and an error is returned.
pub async fn start(config: BridgeConfig) -> Result<RunningBridge> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut links = Vec::with_capacity(config.links.len());

    for link_cfg in config.links {
        let a_addr = parse_bind(&link_cfg.a_bind, link_cfg.a_port);
        let z_addr = parse_bind(&link_cfg.z_bind, link_cfg.z_port);

        let listener_a = TcpListener::bind(&a_addr).await.map_err(|e| {
            LabError::BridgeListen {
                host: a_addr.clone(),
                reason: e.to_string(),
            }
        })?;
        let listener_z = match TcpListener::bind(&z_addr).await {
            Ok(l) => l,
            Err(e) => {
                // listener_a is dropped here, closing its socket.
                return Err(LabError::BridgeListen {
                    host: z_addr,
                    reason: e.to_string(),
                });
            }
        };

        let counters = Arc::new(LinkCounters::default());
        let task_counters = counters.clone();
        let task_cfg = link_cfg.clone();
        let mut task_shutdown = shutdown_rx.clone();

        let task = tokio::spawn(async move {
            loop {
                let stream_a = tokio::select! {
                    _ = task_shutdown.changed() => {
                        info!(a = %task_cfg.a, z = %task_cfg.z, "bridge link shutting down");
                        return;
                    }
                    res = listener_a.accept() => match res {
                        Ok((s, _)) => s,
                        Err(e) => {
                            warn!(error = %e, "accept on A side failed, link worker exiting");
                            return;
                        }
                    }
                };

                let stream_z = tokio::select! {
                    _ = task_shutdown.changed() => {
                        info!(a = %task_cfg.a, z = %task_cfg.z, "bridge link shutting down");
                        return;
                    }
                    res = listener_z.accept() => match res {
                        Ok((s, _)) => s,
                        Err(e) => {
                            warn!(error = %e, "accept on Z side failed, link worker exiting");
                            return;
                        }
                    }
                };

                task_counters.sessions.fetch_add(1, Ordering::SeqCst);
                task_counters.connected.store(true, Ordering::SeqCst);

                splice_session(stream_a, stream_z, &task_counters).await;

                task_counters.connected.store(false, Ordering::SeqCst);
            }
        });

        links.push(LinkRuntime {
            config: link_cfg,
            counters,
            task,
        });
    }

    Ok(RunningBridge { links, shutdown_tx })
}

async fn splice_session(a: TcpStream, z: TcpStream, counters: &Arc<LinkCounters>) {
    let (mut ra, mut wa) = a.into_split();
    let (mut rz, mut wz) = z.into_split();

    let c1 = counters.clone();
    let a_to_z = tokio::spawn(async move { copy_counting(&mut ra, &mut wz, &c1.a_to_z_bytes).await });
    let c2 = counters.clone();
    let z_to_a = tokio::spawn(async move { copy_counting(&mut rz, &mut wa, &c2.z_to_a_bytes).await });

    let _ = tokio::join!(a_to_z, z_to_a);
}

async fn copy_counting(
    reader: &mut (impl AsyncReadExt + Unpin),
    writer: &mut (impl AsyncWriteExt + Unpin),
    counter: &AtomicU64,
) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        counter.fetch_add(n as u64, Ordering::SeqCst);
    }
    let _ = writer.shutdown().await;
}

/// Serve the stats endpoint on a Unix domain socket (always available
/// locally) until the bridge's listeners are torn down.
pub async fn serve_stats_unix(socket_path: &Path, bridge: Arc<RunningBridgeHandle>) -> Result<()> {
    let _ = tokio::fs::remove_file(socket_path).await;
    let listener = UnixListener::bind(socket_path).map_err(|e| LabError::BridgeListen {
        host: socket_path.display().to_string(),
        reason: e.to_string(),
    })?;
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let snapshot = bridge.stats();
        if let Ok(body) = serde_json::to_vec(&snapshot) {
            let _ = stream.write_all(&body).await;
        }
        let _ = stream.shutdown().await;
    }
}

/// Serve the stats endpoint over TCP (present when the bridge runs on a
/// remote host, per `stats_addr`).
pub async fn serve_stats_tcp(addr: &str, bridge: Arc<RunningBridgeHandle>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LabError::BridgeListen {
            host: addr.to_string(),
            reason: e.to_string(),
        })?;
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let snapshot = bridge.stats();
        if let Ok(body) = serde_json::to_vec(&snapshot) {
            let _ = stream.write_all(&body).await;
        }
        let _ = stream.shutdown().await;
    }
}

/// Thread-safe handle used by the stats servers; separate from
/// `RunningBridge` so that shutdown (which consumes it) and read-only stats
/// serving can coexist behind an `Arc`.
pub struct RunningBridgeHandle {
    snapshot_fn: Box<dyn Fn() -> StatsSnapshot + Send + Sync>,
}

impl RunningBridgeHandle {
    pub fn new(bridge: &RunningBridge) -> Self {
        let links: Vec<(BridgeLinkConfig, Arc<LinkCounters>)> = bridge
            .links
            .iter()
            .map(|l| (l.config.clone(), l.counters.clone()))
            .collect();
        Self {
            snapshot_fn: Box::new(move || StatsSnapshot {
                links: links
                    .iter()
                    .map(|(cfg, counters)| LinkStats {
                        a: cfg.a.clone(),
                        z: cfg.z.clone(),
                        a_port: cfg.a_port,
                        z_port: cfg.z_port,
                        a_to_z_bytes: counters.a_to_z_bytes.load(Ordering::SeqCst),
                        z_to_a_bytes: counters.z_to_a_bytes.load(Ordering::SeqCst),
                        sessions: counters.sessions.load(Ordering::SeqCst),
                        connected: counters.connected.load(Ordering::SeqCst),
                    })
                    .collect(),
            }),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        (self.snapshot_fn)()
    }
}

/// Write the process PID to a sibling file so the orchestrator can
/// supervise the (independently surviving) bridge process.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

pub fn read_pid_file(path: &Path) -> std::io::Result<u32> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed pid file"))
}

/// Human-readable byte count, e.g. for `bridge-stats` output (S2).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = UNITS[0];
    for candidate in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = candidate;
    }
    format!("{value:.1} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        portpicker::pick_unused_port().expect("no free port")
    }

    async fn connect_pair(a_port: u16, z_port: u16) -> (TcpStream, TcpStream) {
        let a = TcpStream::connect(("127.0.0.1", a_port)).await.unwrap();
        let z = TcpStream::connect(("127.0.0.1", z_port)).await.unwrap();
        (a, z)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn splices_bytes_both_directions_and_counts_exactly() {
        let a_port = free_port();
        let z_port = free_port();
        let config = BridgeConfig {
            links: vec![BridgeLinkConfig {
                a: "spine1:Ethernet0".to_string(),
                z: "leaf1:Ethernet0".to_string(),
                a_port,
                z_port,
                a_bind: "127.0.0.1".to_string(),
                z_bind: "127.0.0.1".to_string(),
            }],
            stats_addr: String::new(),
        };
        let bridge = start(config).await.unwrap();

        let (mut client_a, mut client_z) = connect_pair(a_port, z_port).await;
        client_a.write_all(b"hello-from-a").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client_z.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-from-a");

        client_z.write_all(b"hi").await.unwrap();
        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        drop(client_a);
        drop(client_z);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = bridge.stats();
        let link = &snapshot.links[0];
        assert_eq!(link.a_to_z_bytes, 12);
        assert_eq!(link.z_to_a_bytes, 2);
        assert_eq!(link.sessions, 1);

        bridge.shutdown().await;
    }

    /// S6 / property 7: after a reconnect, sessions increases and connected
    /// returns to true.
    #[tokio::test(flavor = "multi_thread")]
    async fn reaccepts_after_disconnect() {
        let a_port = free_port();
        let z_port = free_port();
        let config = BridgeConfig {
            links: vec![BridgeLinkConfig {
                a: "spine1:Ethernet0".to_string(),
                z: "leaf1:Ethernet0".to_string(),
                a_port,
                z_port,
                a_bind: "127.0.0.1".to_string(),
                z_bind: "127.0.0.1".to_string(),
            }],
            stats_addr: String::new(),
        };
        let bridge = start(config).await.unwrap();

        let (mut a1, mut z1) = connect_pair(a_port, z_port).await;
        a1.write_all(&[0u8; 100]).await.unwrap();
        let mut buf = [0u8; 256];
        read_exact_n(&mut z1, &mut buf, 100).await;
        z1.write_all(&[0u8; 50]).await.unwrap();
        read_exact_n(&mut a1, &mut buf, 50).await;
        drop(a1);
        drop(z1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (mut a2, mut z2) = connect_pair(a_port, z_port).await;
        a2.write_all(&[0u8; 10]).await.unwrap();
        read_exact_n(&mut z2, &mut buf, 10).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = bridge.stats();
        let link = &snapshot.links[0];
        assert_eq!(link.a_to_z_bytes, 110);
        assert_eq!(link.z_to_a_bytes, 50);
        assert_eq!(link.sessions, 2);
        assert!(link.connected);

        bridge.shutdown().await;
    }

    async fn read_exact_n(stream: &mut TcpStream, buf: &mut [u8], total: usize) {
        let mut read = 0;
        while read < total {
            let n = stream.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
    }

    /// S2.
    #[test]
    fn human_bytes_matches_reference_values() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1024), "1.0 KB");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(1048576), "1.0 MB");
        assert_eq!(human_bytes(1073741824), "1.0 GB");
        assert_eq!(human_bytes(1610612736), "1.5 GB");
    }

    #[tokio::test]
    async fn listen_failure_is_fatal_and_closes_prior_listeners() {
        let a_port = free_port();
        let z_port = free_port();
        let _blocker = TcpListener::bind(("0.0.0.0", z_port)).await.unwrap();

        let config = BridgeConfig {
            links: vec![BridgeLinkConfig {
                a: "spine1:Ethernet0".to_string(),
                z: "leaf1:Ethernet0".to_string(),
                a_port,
                z_port,
                a_bind: "127.0.0.1".to_string(),
                z_bind: "0.0.0.0".to_string(),
            }],
            stats_addr: String::new(),
        };

        let err = start(config).await.unwrap_err();
        assert!(matches!(err, LabError::BridgeListen { .. }));

        // a_port's listener should have been dropped/closed; rebinding it
        // must succeed.
        let relisten = TcpListener::bind(("127.0.0.1", a_port)).await;
        assert!(relisten.is_ok());
    }
}
