//! Placement (C4): spread unpinned devices across a server pool, and choose
//! which server runs a given link's bridge worker.

use std::collections::BTreeMap;

use crate::error::{LabError, Result};
use crate::spec::Server;

/// Assign every node in `nodes` (sorted by name) a `Host` string (empty =
/// local/no-server-pool). Pinned nodes (already carrying a non-empty `host`)
/// are validated against capacity; unpinned nodes are assigned the
/// lowest-loaded server, ties broken alphabetically.
///
/// Returns a map from node name to assigned host. If `servers` is empty this
/// is a no-op: every node maps to `""` (single-host lab).
pub fn place_nodes<'a>(
    node_names: impl Iterator<Item = &'a str>,
    pins: &BTreeMap<String, String>,
    servers: &[Server],
) -> Result<BTreeMap<String, String>> {
    let mut names: Vec<&str> = node_names.collect();
    names.sort_unstable();

    if servers.is_empty() {
        return Ok(names.into_iter().map(|n| (n.to_string(), String::new())).collect());
    }

    let server_names: std::collections::HashSet<&str> =
        servers.iter().map(|s| s.name.as_str()).collect();
    let max_nodes: BTreeMap<&str, u32> =
        servers.iter().map(|s| (s.name.as_str(), s.max_nodes)).collect();

    let mut load: BTreeMap<&str, u32> = servers.iter().map(|s| (s.name.as_str(), 0)).collect();

    // First pass: validate and count pinned nodes.
    for name in &names {
        if let Some(pin) = pins.get(*name) {
            if pin.is_empty() {
                continue;
            }
            if !server_names.contains(pin.as_str()) {
                return Err(LabError::PlacementUnknownServer {
                    device: name.to_string(),
                    server: pin.clone(),
                });
            }
            *load.get_mut(pin.as_str()).unwrap() += 1;
        }
    }
    for (server, count) in &load {
        let max = max_nodes[server];
        if max != 0 && *count > max {
            return Err(LabError::PlacementOverCapacity {
                server: server.to_string(),
                max_nodes: max,
                requested: *count,
            });
        }
    }

    let mut result = BTreeMap::new();
    for name in &names {
        if let Some(pin) = pins.get(*name) {
            if !pin.is_empty() {
                result.insert(name.to_string(), pin.clone());
                continue;
            }
        }

        let chosen = servers
            .iter()
            .map(|s| s.name.as_str())
            .filter(|s| {
                let max = max_nodes[s];
                max == 0 || load[s] < max
            })
            .min_by_key(|s| (load[s], *s))
            .ok_or_else(|| LabError::PlacementOverCapacity {
                server: "*".to_string(),
                max_nodes: 0,
                requested: load.values().sum::<u32>() + 1,
            })?;

        *load.get_mut(chosen).unwrap() += 1;
        result.insert(name.to_string(), chosen.to_string());
    }

    Ok(result)
}

/// Choose the worker host for a link given its two endpoint hosts.
/// Same-host links run on that host. Cross-host links choose the host with
/// fewer workers so far, ties broken alphabetically (deterministic).
pub fn place_worker(
    a_host: &str,
    z_host: &str,
    worker_load: &mut BTreeMap<String, u32>,
) -> String {
    let chosen = if a_host == z_host {
        a_host.to_string()
    } else {
        let a_load = *worker_load.get(a_host).unwrap_or(&0);
        let z_load = *worker_load.get(z_host).unwrap_or(&0);
        if a_load < z_load {
            a_host.to_string()
        } else if z_load < a_load {
            z_host.to_string()
        } else {
            std::cmp::min(a_host, z_host).to_string()
        }
    };
    *worker_load.entry(chosen.clone()).or_insert(0) += 1;
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<Server> {
        vec![
            Server {
                name: "server-a".to_string(),
                address: "10.0.0.1".to_string(),
                max_nodes: 2,
            },
            Server {
                name: "server-b".to_string(),
                address: "10.0.0.2".to_string(),
                max_nodes: 2,
            },
        ]
    }

    /// S3: four unpinned nodes, two servers with MaxNodes=2 -> 2/2 split.
    #[test]
    fn spreads_unpinned_nodes_evenly() {
        let names = ["leaf1", "leaf2", "spine1", "spine2"];
        let pins = BTreeMap::new();
        let placement = place_nodes(names.into_iter(), &pins, &servers()).unwrap();

        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for host in placement.values() {
            *counts.entry(host.as_str()).or_insert(0) += 1;
        }
        assert_eq!(counts["server-a"], 2);
        assert_eq!(counts["server-b"], 2);
    }

    /// S4: leaf1 pinned to server-a, rest unpinned, counts still 2/2,
    /// determinism across repeated runs.
    #[test]
    fn respects_pin_and_is_deterministic() {
        let names = ["leaf1", "leaf2", "spine1", "spine2"];
        let mut pins = BTreeMap::new();
        pins.insert("leaf1".to_string(), "server-a".to_string());

        let p1 = place_nodes(names.into_iter(), &pins, &servers()).unwrap();
        let p2 = place_nodes(names.into_iter(), &pins, &servers()).unwrap();

        assert_eq!(p1["leaf1"], "server-a");
        assert_eq!(p1, p2);

        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for host in p1.values() {
            *counts.entry(host.as_str()).or_insert(0) += 1;
        }
        assert_eq!(counts["server-a"], 2);
        assert_eq!(counts["server-b"], 2);
    }

    #[test]
    fn unknown_pinned_server_fails() {
        let names = ["leaf1"];
        let mut pins = BTreeMap::new();
        pins.insert("leaf1".to_string(), "server-z".to_string());
        let err = place_nodes(names.into_iter(), &pins, &servers()).unwrap_err();
        assert!(matches!(err, LabError::PlacementUnknownServer { .. }));
    }

    #[test]
    fn over_capacity_pin_fails() {
        let names = ["leaf1", "leaf2", "leaf3"];
        let mut pins = BTreeMap::new();
        pins.insert("leaf1".to_string(), "server-a".to_string());
        pins.insert("leaf2".to_string(), "server-a".to_string());
        pins.insert("leaf3".to_string(), "server-a".to_string());
        let err = place_nodes(names.into_iter(), &pins, &servers()).unwrap_err();
        assert!(matches!(err, LabError::PlacementOverCapacity { .. }));
    }

    #[test]
    fn no_servers_is_single_host_noop() {
        let names = ["leaf1", "spine1"];
        let placement = place_nodes(names.into_iter(), &BTreeMap::new(), &[]).unwrap();
        assert!(placement.values().all(|h| h.is_empty()));
    }

    #[test]
    fn worker_placement_is_deterministic_and_balances() {
        let mut load = BTreeMap::new();
        assert_eq!(place_worker("server-a", "server-a", &mut load), "server-a");
        assert_eq!(place_worker("server-a", "server-b", &mut load), "server-b");
        assert_eq!(place_worker("server-a", "server-b", &mut load), "server-a");
    }
}
