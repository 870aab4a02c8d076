//! Port probe (C9): pre-flight local and remote port conflict detection.
//!
//! Runs before any resource is allocated. Local ports are checked with a
//! direct bind-then-close; remote ports are checked with one `ss` invocation
//! per host covering every port on that host.

use std::collections::BTreeMap;

use tokio::net::TcpListener;

use crate::error::{LabError, PortConflict, Result};
use crate::transport::Transport;

/// `host -> ports required on that host`. The empty-string host is local.
pub type PortRequirements = BTreeMap<String, Vec<u16>>;

pub async fn probe(requirements: &PortRequirements, transport: &Transport) -> Result<()> {
    let mut conflicts = Vec::new();

    for (host, ports) in requirements {
        if host.is_empty() {
            for &port in ports {
                if !local_port_free(port).await {
                    conflicts.push(PortConflict {
                        host: "local".to_string(),
                        port,
                    });
                }
            }
        } else {
            let in_use = remote_ports_in_use(transport, host, ports).await?;
            for port in in_use {
                conflicts.push(PortConflict {
                    host: host.clone(),
                    port,
                });
            }
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        conflicts.sort_by(|a, b| (a.host.as_str(), a.port).cmp(&(b.host.as_str(), b.port)));
        Err(LabError::PortInUse(conflicts))
    }
}

async fn local_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

async fn remote_ports_in_use(transport: &Transport, host: &str, ports: &[u16]) -> Result<Vec<u16>> {
    if ports.is_empty() {
        return Ok(Vec::new());
    }
    let clauses: Vec<String> = ports.iter().map(|p| format!("sport = :{p}")).collect();
    let filter = format!("( {} )", clauses.join(" or "));
    let out = transport
        .exec(host, "ss", &["-tlnH".to_string(), filter])
        .await?;

    let mut in_use = Vec::new();
    for &port in ports {
        let needle = format!(":{port} ");
        let needle_eof = format!(":{port}\n");
        if out.contains(&needle) || out.ends_with(&format!(":{port}")) || out.contains(&needle_eof) {
            in_use.push(port);
        }
    }
    Ok(in_use)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_local_conflict() {
        let port = portpicker::pick_unused_port().unwrap();
        let _listener = TcpListener::bind(("0.0.0.0", port)).await.unwrap();

        let mut reqs = PortRequirements::new();
        reqs.insert(String::new(), vec![port]);

        let transport = Transport::new(std::path::PathBuf::from("/tmp"), "test".to_string());
        let err = probe(&reqs, &transport).await.unwrap_err();
        match err {
            LabError::PortInUse(conflicts) => {
                assert_eq!(conflicts[0].port, port);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn free_local_port_passes() {
        let port = portpicker::pick_unused_port().unwrap();
        let mut reqs = PortRequirements::new();
        reqs.insert(String::new(), vec![port]);

        let transport = Transport::new(std::path::PathBuf::from("/tmp"), "test".to_string());
        probe(&reqs, &transport).await.unwrap();
    }
}
