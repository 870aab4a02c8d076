//! Link allocator (C5): assigns per-link TCP port pairs, bind/connect
//! addresses, and attaches NIC descriptors to the endpoint `NodeConfig`s.

use std::collections::{BTreeMap, HashMap};

use crate::error::{LabError, Result};
use crate::placement::place_worker;
use crate::resolver::generate_mac;
use crate::spec::Link;
use crate::types::{Bind, HostVmGroup, LinkConfig, LinkEndpoint, Nic, NodeConfig};

/// Parse `"<device>:<interface>"`.
fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    endpoint
        .split_once(':')
        .ok_or_else(|| LabError::SpecInvalid(format!("malformed link endpoint {endpoint:?}")))
}

/// Extract the numeric suffix of an `ethN`-style interface name, as used for
/// a host device's own interface naming before it is folded into a
/// synthetic VM.
fn eth_index(interface: &str) -> Result<u32> {
    interface
        .strip_prefix("eth")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| LabError::SpecInvalid(format!("expected ethN interface, got {interface:?}")))
}

struct Resolved {
    node_name: String,
    nic_index: u32,
    interface: String,
}

fn resolve_endpoint(
    endpoint: &str,
    nodes: &BTreeMap<String, NodeConfig>,
    host_groups: &[HostVmGroup],
) -> Result<Resolved> {
    let (device, interface) = split_endpoint(endpoint)?;

    if let Some(group) = host_groups.iter().find(|g| g.hosts.contains(&device.to_string())) {
        let base = group.nic_base[device];
        let nic_index = base + eth_index(interface)?;
        return Ok(Resolved {
            node_name: group.vm_name.clone(),
            nic_index,
            interface: interface.to_string(),
        });
    }

    let node = nodes
        .get(device)
        .ok_or_else(|| LabError::SpecInvalid(format!("unknown device {device:?} in link")))?;
    let nic_index = node.interface_map.resolve_nic_index(interface)?;
    Ok(Resolved {
        node_name: device.to_string(),
        nic_index,
        interface: interface.to_string(),
    })
}

/// Allocate ports, binds, and connect addresses for every link, mutating
/// each endpoint `NodeConfig`'s NIC list in place.
///
/// `host_addresses` maps a worker-host name to its reachable IP address
/// (orchestration `Hosts` map); the local/empty host is never looked up.
pub fn allocate_links(
    links: &[Link],
    nodes: &mut BTreeMap<String, NodeConfig>,
    host_groups: &[HostVmGroup],
    link_port_base: u16,
    host_addresses: &HashMap<String, String>,
) -> Result<Vec<LinkConfig>> {
    let mut worker_load: BTreeMap<String, u32> = BTreeMap::new();
    let mut result = Vec::with_capacity(links.len());

    for (i, link) in links.iter().enumerate() {
        let a = resolve_endpoint(&link.a, nodes, host_groups)?;
        let z = resolve_endpoint(&link.z, nodes, host_groups)?;

        let a_port = link_port_base
            .checked_add((2 * i) as u16)
            .ok_or_else(|| LabError::SpecInvalid("link port base overflow".to_string()))?;
        let z_port = a_port + 1;

        let a_host = nodes
            .get(&a.node_name)
            .ok_or_else(|| LabError::SpecInvalid(format!("unknown device {:?}", a.node_name)))?
            .host
            .clone();
        let z_host = nodes
            .get(&z.node_name)
            .ok_or_else(|| LabError::SpecInvalid(format!("unknown device {:?}", z.node_name)))?
            .host
            .clone();

        let worker_host = place_worker(&a_host, &z_host, &mut worker_load);

        let a_bind = if a_host == worker_host { Bind::Loopback } else { Bind::Any };
        let z_bind = if z_host == worker_host { Bind::Loopback } else { Bind::Any };

        let connect_addr = |endpoint_host: &str, port: u16| -> Result<String> {
            if endpoint_host == worker_host {
                Ok(format!("127.0.0.1:{port}"))
            } else {
                let ip = if worker_host.is_empty() {
                    "127.0.0.1".to_string()
                } else {
                    host_addresses.get(&worker_host).cloned().ok_or_else(|| {
                        LabError::SpecInvalid(format!(
                            "no address configured for worker host {worker_host:?}"
                        ))
                    })?
                };
                Ok(format!("{ip}:{port}"))
            }
        };

        let a_connect = connect_addr(&a_host, a_port)?;
        let z_connect = connect_addr(&z_host, z_port)?;

        append_nic(nodes, &a.node_name, a.nic_index, &a.interface, a_connect)?;
        append_nic(nodes, &z.node_name, z.nic_index, &z.interface, z_connect)?;

        result.push(LinkConfig {
            a: LinkEndpoint {
                device: a.node_name,
                interface: a.interface,
                nic_index: a.nic_index,
            },
            z: LinkEndpoint {
                device: z.node_name,
                interface: z.interface,
                nic_index: z.nic_index,
            },
            a_port,
            z_port,
            a_bind,
            z_bind,
            worker_host,
        });
    }

    Ok(result)
}

fn append_nic(
    nodes: &mut BTreeMap<String, NodeConfig>,
    node_name: &str,
    nic_index: u32,
    interface: &str,
    connect_addr: String,
) -> Result<()> {
    if nic_index == 0 {
        return Err(LabError::SpecInvalid(format!(
            "link endpoint on {node_name:?} resolved to NIC 0 (management)"
        )));
    }
    let node = nodes
        .get_mut(node_name)
        .ok_or_else(|| LabError::SpecInvalid(format!("unknown device {node_name:?}")))?;
    let mac = generate_mac(node_name, nic_index);
    node.nics.push(Nic {
        index: nic_index,
        netdev_id: format!("eth{nic_index}"),
        interface: interface.to_string(),
        connect_addr: Some(connect_addr),
        mac,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::InterfaceMap;
    use crate::types::ResolvedDeviceType;

    fn switch(name: &str, host: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            platform: "sonic-vpp".to_string(),
            device_type: ResolvedDeviceType::Switch,
            image: "img".to_string(),
            memory: 4096,
            cpus: 2,
            nic_driver: "e1000".to_string(),
            interface_map: InterfaceMap::Stride4,
            cpu_features: None,
            ssh_user: "admin".to_string(),
            ssh_pass: String::new(),
            console_user: "admin".to_string(),
            console_pass: String::new(),
            boot_timeout_secs: 180,
            host: host.to_string(),
            ssh_port: 0,
            console_port: 0,
            nics: vec![Nic::mgmt(generate_mac(name, 0))],
        }
    }

    /// S1: three links, base port 20000 -> ports as specified.
    #[test]
    fn allocates_sequential_ports_single_host() {
        let mut nodes = BTreeMap::new();
        nodes.insert("spine1".to_string(), switch("spine1", ""));
        nodes.insert("leaf1".to_string(), switch("leaf1", ""));

        let links = vec![
            Link { a: "spine1:Ethernet0".to_string(), z: "leaf1:Ethernet0".to_string() },
            Link { a: "spine1:Ethernet4".to_string(), z: "leaf1:Ethernet4".to_string() },
            Link { a: "spine1:Ethernet8".to_string(), z: "leaf1:Ethernet8".to_string() },
        ];

        let allocated =
            allocate_links(&links, &mut nodes, &[], 20000, &HashMap::new()).unwrap();

        assert_eq!(allocated[0].a_port, 20000);
        assert_eq!(allocated[0].z_port, 20001);
        assert_eq!(allocated[1].a_port, 20002);
        assert_eq!(allocated[1].z_port, 20003);
        assert_eq!(allocated[2].a_port, 20004);
        assert_eq!(allocated[2].z_port, 20005);

        for link in &allocated {
            assert!(link.a.nic_index >= 1);
            assert!(link.z.nic_index >= 1);
            assert_ne!(link.a_port, link.z_port);
        }

        assert_eq!(nodes["spine1"].nics.len(), 4); // mgmt + 3 data
        assert_eq!(nodes["spine1"].nics[1].index, 1);
    }

    #[test]
    fn cross_host_links_bind_any_on_non_worker_side() {
        let mut nodes = BTreeMap::new();
        nodes.insert("spine1".to_string(), switch("spine1", "server-a"));
        nodes.insert("leaf1".to_string(), switch("leaf1", "server-b"));

        let mut addrs = HashMap::new();
        addrs.insert("server-a".to_string(), "10.0.0.1".to_string());
        addrs.insert("server-b".to_string(), "10.0.0.2".to_string());

        let links = vec![Link { a: "spine1:Ethernet0".to_string(), z: "leaf1:Ethernet0".to_string() }];
        let allocated = allocate_links(&links, &mut nodes, &[], 20000, &addrs).unwrap();

        let link = &allocated[0];
        // worker runs on whichever host wins the tie-break (alphabetically
        // first since load starts even): server-a.
        assert_eq!(link.worker_host, "server-a");
        assert_eq!(link.a_bind, Bind::Loopback);
        assert_eq!(link.z_bind, Bind::Any);
    }
}
