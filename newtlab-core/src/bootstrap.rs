//! Console bootstrap (C10): drives each VM's serial console through login
//! and DHCP, then polls for SSH readiness and injects the lab's public key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{LabError, PhaseError};
use crate::transport::Transport;
use crate::types::{NodeConfig, ResolvedDeviceType};

const SSH_READY_DEADLINE: Duration = Duration::from_secs(60);
const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;

/// A console-session step either times out waiting for a pattern, or fails
/// for some other reason (connection closed, io error). Only the former maps
/// onto the named `ConsoleLoginTimeout` error kind.
enum ConsoleStepError {
    TimedOut,
    Other(String),
}

impl std::fmt::Display for ConsoleStepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleStepError::TimedOut => write!(f, "timed out"),
            ConsoleStepError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Reads from a serial console stream until `pattern` appears in the
/// accumulated buffer, or `deadline` elapses.
async fn wait_for(stream: &mut TcpStream, pattern: &str, deadline: Duration) -> Result<(), ConsoleStepError> {
    let start = Instant::now();
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if start.elapsed() >= deadline {
            return Err(ConsoleStepError::TimedOut);
        }
        let remaining = deadline - start.elapsed();
        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ConsoleStepError::Other("console connection closed".to_string())),
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > 64 * 1024 {
                    buf.drain(0..buf.len() - 64 * 1024);
                }
                if String::from_utf8_lossy(&buf).contains(pattern) {
                    return Ok(());
                }
            }
            Ok(Err(e)) => return Err(ConsoleStepError::Other(e.to_string())),
            Err(_) => return Err(ConsoleStepError::TimedOut),
        }
    }
}

async fn send_line(stream: &mut TcpStream, line: &str) -> Result<(), ConsoleStepError> {
    stream
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|e| ConsoleStepError::Other(e.to_string()))
}

/// Drive one node's console session: login prompt, credentials, and (for
/// switches) DHCP + SSH-account creation + pubkey injection. Host/host-vm
/// devices only wait for the prompt; DHCP happens via image-default init.
async fn drive_console(node: &NodeConfig, pubkey: &str) -> Result<(), ConsoleStepError> {
    let addr = format!("127.0.0.1:{}", node.console_port);
    let deadline = Duration::from_secs(node.boot_timeout_secs);

    let mut stream = timeout(Duration::from_secs(10), TcpStream::connect(&addr))
        .await
        .map_err(|_| ConsoleStepError::TimedOut)?
        .map_err(|e| ConsoleStepError::Other(e.to_string()))?;

    wait_for(&mut stream, "login:", deadline).await?;
    send_line(&mut stream, &node.console_user).await?;
    wait_for(&mut stream, "Password:", Duration::from_secs(10)).await?;
    send_line(&mut stream, &node.console_pass).await?;
    wait_for(&mut stream, "#", Duration::from_secs(30)).await?;

    if node.device_type == ResolvedDeviceType::Switch {
        send_line(&mut stream, "sudo ip link set eth0 up && sudo dhclient eth0").await?;
        wait_for(&mut stream, "#", Duration::from_secs(30)).await?;

        send_line(
            &mut stream,
            &format!(
                "sudo useradd -m -s /bin/bash {0} 2>/dev/null; echo '{0}:{1}' | sudo chpasswd",
                node.ssh_user, node.ssh_pass
            ),
        )
        .await?;
        wait_for(&mut stream, "#", Duration::from_secs(15)).await?;

        send_line(
            &mut stream,
            &format!(
                "sudo mkdir -p /home/{0}/.ssh && echo '{1}' | sudo tee -a /home/{0}/.ssh/authorized_keys >/dev/null && sudo chown -R {0}:{0} /home/{0}/.ssh",
                node.ssh_user, pubkey
            ),
        )
        .await?;
        wait_for(&mut stream, "#", Duration::from_secs(15)).await?;
    }

    Ok(())
}

/// Poll a node over SSH until a trivial command succeeds or the shared
/// deadline expires. The sole failure path is the deadline itself, so it
/// always surfaces as `LabError::SshTimeout`.
pub async fn poll_ssh_ready(transport: &Transport, node: &NodeConfig, identity: Option<&Path>) -> Result<(), LabError> {
    let start = Instant::now();
    loop {
        let result = transport
            .exec_port(&guest_host_arg(node), node.ssh_port, identity, "true", &[])
            .await;
        if result.is_ok() {
            return Ok(());
        }
        if start.elapsed() >= SSH_READY_DEADLINE {
            return Err(LabError::SshTimeout {
                node: node.name.clone(),
                timeout_secs: SSH_READY_DEADLINE.as_secs(),
            });
        }
        tokio::time::sleep(SSH_POLL_INTERVAL).await;
    }
}

/// `ssh` destination for a node's forwarded management port, always via
/// loopback (QEMU user-mode networking hostfwd).
pub fn guest_host_arg(node: &NodeConfig) -> String {
    format!("{}@127.0.0.1", node.ssh_user)
}

/// Run console bootstrap and SSH-readiness polling for every node in
/// parallel, one task per node, latching the first error while letting
/// every other node continue (spec.md §5 "shared first-error latch").
pub async fn bootstrap_all(
    nodes: &[NodeConfig],
    pubkey: &str,
    transport: &Transport,
    identity: Option<&Path>,
) -> Vec<PhaseError> {
    let identity = identity.map(PathBuf::from);
    let errors: Arc<Mutex<Vec<PhaseError>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();

    for node in nodes {
        let node = node.clone();
        let pubkey = pubkey.to_string();
        let errors = errors.clone();

        tasks.push(tokio::spawn(async move {
            if let Err(e) = drive_console(&node, &pubkey).await {
                let entry = match e {
                    ConsoleStepError::TimedOut => PhaseError::new(
                        "bootstrapping",
                        Some(node.name.clone()),
                        LabError::ConsoleLoginTimeout {
                            node: node.name.clone(),
                            timeout_secs: node.boot_timeout_secs,
                        },
                    ),
                    ConsoleStepError::Other(msg) => PhaseError::new("bootstrapping", Some(node.name.clone()), msg),
                };
                warn!(node = %node.name, error = %entry, "console bootstrap failed");
                errors.lock().await.push(entry);
                return;
            }
            debug!(node = %node.name, "console bootstrap complete");
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    let mut tasks = Vec::new();
    for node in nodes {
        let node = node.clone();
        let errors = errors.clone();
        let transport_clone = transport.clone();
        let identity = identity.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = poll_ssh_ready(&transport_clone, &node, identity.as_deref()).await {
                warn!(node = %node.name, error = %e, "ssh readiness poll failed");
                errors
                    .lock()
                    .await
                    .push(PhaseError::new("ssh-ready", Some(node.name.clone()), e));
            } else {
                info!(node = %node.name, "ssh ready");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    Arc::try_unwrap(errors).unwrap().into_inner()
}

/// Sequentially append the lab public key to every still-running node's
/// `~/.ssh/authorized_keys` (best-effort; failures are logged, not fatal).
pub async fn inject_keys(nodes: &[NodeConfig], pubkey: &str, transport: &Transport, identity: Option<&Path>) {
    for node in nodes {
        let cmd = format!("mkdir -p ~/.ssh && echo '{pubkey}' >> ~/.ssh/authorized_keys");
        if let Err(e) = transport
            .exec_port(&guest_host_arg(node), node.ssh_port, identity, "sh", &["-c".to_string(), cmd])
            .await
        {
            warn!(node = %node.name, error = %e, "best-effort key injection failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_host_arg_uses_ssh_user_over_loopback() {
        let node = crate::resolver::resolve_node(
            "spine1",
            &crate::spec::DeviceProfile {
                platform: "sonic-vpp".to_string(),
                ssh_user: Some("admin".to_string()),
                ..Default::default()
            },
            &crate::spec::PlatformSpec {
                vm_image: Some("img".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(guest_host_arg(&node), "admin@127.0.0.1");
    }
}
