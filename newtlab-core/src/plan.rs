//! `NewLab` (§3 "Lifecycle"): the one-shot plan builder that threads specs
//! through the resolver, coalescer, placement, and link allocator in the
//! fixed order C2 → C3 → C4 → C5.

use std::collections::{BTreeMap, HashMap};

use crate::coalesce::coalesce_hosts;
use crate::error::Result;
use crate::linkalloc::allocate_links;
use crate::placement::place_nodes;
use crate::resolver::resolve_node;
use crate::spec::{DeviceProfile, Link, PlatformSpec, TopologySpec};
use crate::types::LabPlan;

/// If `topology.links` is empty, derive the link list from each device's
/// `Interfaces[*].link` field: interfaces sharing the same link id are
/// paired into one `Link{a, z}`.
pub fn derive_links(topology: &TopologySpec) -> Vec<Link> {
    if !topology.links.is_empty() {
        return topology.links.clone();
    }

    let mut by_link_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut devices: Vec<&String> = topology.devices.keys().collect();
    devices.sort();
    for device in devices {
        let spec = &topology.devices[device];
        for iface in &spec.interfaces {
            if let Some(link_id) = &iface.link {
                by_link_id
                    .entry(link_id.clone())
                    .or_default()
                    .push(format!("{device}:{}", iface.name));
            }
        }
    }

    by_link_id
        .into_values()
        .filter(|endpoints| endpoints.len() == 2)
        .map(|mut endpoints| {
            let z = endpoints.pop().unwrap();
            let a = endpoints.pop().unwrap();
            Link { a, z }
        })
        .collect()
}

fn endpoint_device(endpoint: &str) -> &str {
    endpoint.split_once(':').map(|(d, _)| d).unwrap_or(endpoint)
}

/// Build the full executable plan for one lab operation: resolved nodes,
/// allocated links, and any host-coalescing groups.
pub fn new_lab(
    topology: &TopologySpec,
    platforms: &HashMap<String, PlatformSpec>,
    profiles: &HashMap<String, DeviceProfile>,
) -> Result<LabPlan> {
    let links = derive_links(topology);

    let mut device_names: Vec<&String> = topology.devices.keys().collect();
    device_names.sort();

    let mut nodes = BTreeMap::new();
    for name in device_names {
        let default_profile = DeviceProfile::default();
        let profile = profiles.get(name).unwrap_or(&default_profile);
        let platform = platforms.get(&profile.platform).cloned().unwrap_or_default();
        let node = resolve_node(name, profile, &platform)?;
        nodes.insert(name.clone(), node);
    }

    let link_count = |device: &str| -> u32 {
        links
            .iter()
            .filter(|l| endpoint_device(&l.a) == device || endpoint_device(&l.z) == device)
            .count() as u32
    };
    let (mut nodes, host_groups) = coalesce_hosts(nodes, link_count);

    let orchestration = topology.orchestration.clone().unwrap_or_default();
    let pins: BTreeMap<String, String> = nodes
        .iter()
        .map(|(name, node)| (name.clone(), node.host.clone()))
        .collect();
    let placement = place_nodes(nodes.keys().map(|s| s.as_str()), &pins, &orchestration.servers)?;
    for (name, host) in &placement {
        if let Some(node) = nodes.get_mut(name) {
            node.host = host.clone();
        }
    }

    let host_addresses: HashMap<String, String> = orchestration
        .servers
        .iter()
        .map(|s| (s.name.clone(), s.address.clone()))
        .collect();
    let allocated_links = allocate_links(
        &links,
        &mut nodes,
        &host_groups,
        orchestration.link_port_base,
        &host_addresses,
    )?;

    Ok(LabPlan {
        nodes,
        links: allocated_links,
        host_groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Credentials, DeviceSpec, InterfaceSpec, Orchestration, Server};

    fn sonic_platform() -> PlatformSpec {
        PlatformSpec {
            vm_image: Some("sonic-vpp.img".to_string()),
            vm_interface_map: Some(crate::spec::InterfaceMapScheme::Stride4),
            vm_credentials: Some(Credentials {
                user: "admin".to_string(),
                pass: "pw".to_string(),
            }),
            ..Default::default()
        }
    }

    /// S1 topology/platform/link shape, exercised end to end through
    /// `new_lab`.
    #[test]
    fn builds_two_node_plan_with_three_links() {
        let mut devices = HashMap::new();
        devices.insert("spine1".to_string(), DeviceSpec::default());
        devices.insert("leaf1".to_string(), DeviceSpec::default());

        let topology = TopologySpec {
            devices,
            links: vec![
                Link { a: "spine1:Ethernet0".to_string(), z: "leaf1:Ethernet0".to_string() },
                Link { a: "spine1:Ethernet4".to_string(), z: "leaf1:Ethernet4".to_string() },
                Link { a: "spine1:Ethernet8".to_string(), z: "leaf1:Ethernet8".to_string() },
            ],
            orchestration: Some(Orchestration {
                link_port_base: 20000,
                ..Default::default()
            }),
        };

        let mut platforms = HashMap::new();
        platforms.insert("sonic-vpp".to_string(), sonic_platform());

        let mut profiles = HashMap::new();
        profiles.insert("spine1".to_string(), DeviceProfile { platform: "sonic-vpp".to_string(), ..Default::default() });
        profiles.insert("leaf1".to_string(), DeviceProfile { platform: "sonic-vpp".to_string(), ..Default::default() });

        let plan = new_lab(&topology, &platforms, &profiles).unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.links.len(), 3);
        assert_eq!(plan.links[0].a_port, 20000);
        assert_eq!(plan.links[0].z_port, 20001);
    }

    #[test]
    fn derives_links_from_interface_link_ids_when_topology_links_empty() {
        let mut devices = HashMap::new();
        devices.insert(
            "spine1".to_string(),
            DeviceSpec {
                interfaces: vec![InterfaceSpec {
                    name: "Ethernet0".to_string(),
                    link: Some("l0".to_string()),
                    ip: None,
                }],
            },
        );
        devices.insert(
            "leaf1".to_string(),
            DeviceSpec {
                interfaces: vec![InterfaceSpec {
                    name: "Ethernet0".to_string(),
                    link: Some("l0".to_string()),
                    ip: None,
                }],
            },
        );

        let topology = TopologySpec {
            devices,
            links: Vec::new(),
            orchestration: None,
        };

        let mut platforms = HashMap::new();
        platforms.insert("sonic-vpp".to_string(), sonic_platform());
        let mut profiles = HashMap::new();
        profiles.insert("spine1".to_string(), DeviceProfile { platform: "sonic-vpp".to_string(), ..Default::default() });
        profiles.insert("leaf1".to_string(), DeviceProfile { platform: "sonic-vpp".to_string(), ..Default::default() });

        let plan = new_lab(&topology, &platforms, &profiles).unwrap();
        assert_eq!(plan.links.len(), 1);
    }

    #[test]
    fn placement_spreads_across_two_servers() {
        let mut devices = HashMap::new();
        for name in ["leaf1", "leaf2", "spine1", "spine2"] {
            devices.insert(name.to_string(), DeviceSpec::default());
        }
        let topology = TopologySpec {
            devices,
            links: Vec::new(),
            orchestration: Some(Orchestration {
                servers: vec![
                    Server { name: "server-a".to_string(), address: "10.0.0.1".to_string(), max_nodes: 2 },
                    Server { name: "server-b".to_string(), address: "10.0.0.2".to_string(), max_nodes: 2 },
                ],
                ..Default::default()
            }),
        };
        let mut platforms = HashMap::new();
        platforms.insert("sonic-vpp".to_string(), sonic_platform());
        let mut profiles = HashMap::new();
        for name in ["leaf1", "leaf2", "spine1", "spine2"] {
            profiles.insert(name.to_string(), DeviceProfile { platform: "sonic-vpp".to_string(), ..Default::default() });
        }

        let plan = new_lab(&topology, &platforms, &profiles).unwrap();
        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for node in plan.nodes.values() {
            *counts.entry(node.host.as_str()).or_insert(0) += 1;
        }
        assert_eq!(counts["server-a"], 2);
        assert_eq!(counts["server-b"], 2);
    }
}
