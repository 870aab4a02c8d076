//! Host coalescer (C3): folds multiple `host` devices that share a physical
//! server into one synthetic multi-NIC VM.
//!
//! Only runs when at least one device is `DeviceType::Host`. Devices with no
//! `VMHost` pin share the empty-string partition, i.e. they are all folded
//! together onto "the local host".

use std::collections::{BTreeMap, HashMap};

use crate::types::{HostVmGroup, Nic, NodeConfig, ResolvedDeviceType};

/// Partitions host-type nodes by their `host` pin and replaces each
/// partition with one synthetic `hostvm-I` node. Returns the (possibly)
/// mutated node map plus the group records needed to rewrite link endpoints.
///
/// `link_count` must return the number of link endpoints a given original
/// host device participates in, used to compute each folded host's
/// contiguous NIC base.
pub fn coalesce_hosts(
    mut nodes: BTreeMap<String, NodeConfig>,
    link_count: impl Fn(&str) -> u32,
) -> (BTreeMap<String, NodeConfig>, Vec<HostVmGroup>) {
    let host_names: Vec<String> = nodes
        .iter()
        .filter(|(_, n)| n.device_type == ResolvedDeviceType::Host)
        .map(|(name, _)| name.clone())
        .collect();

    if host_names.is_empty() {
        return (nodes, Vec::new());
    }

    // Partition by VMHost pin (persisted on the node's `host` field at
    // resolution time -- §4.3 uses the profile's VMHost value).
    let mut partitions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &host_names {
        let host_pin = nodes[name].host.clone();
        partitions.entry(host_pin).or_default().push(name.clone());
    }
    for hosts in partitions.values_mut() {
        hosts.sort();
    }

    let mut groups = Vec::new();
    for (i, (_, hosts)) in partitions.into_iter().enumerate() {
        let vm_name = format!("hostvm-{i}");
        let template = nodes[&hosts[0]].clone();

        let mut nic_base = HashMap::new();
        let mut next_index = 1u32;
        for host in &hosts {
            nic_base.insert(host.clone(), next_index);
            next_index += link_count(host);
        }

        let synthetic = NodeConfig {
            name: vm_name.clone(),
            platform: template.platform,
            device_type: ResolvedDeviceType::HostVm,
            image: template.image,
            memory: template.memory,
            cpus: template.cpus,
            nic_driver: template.nic_driver,
            interface_map: template.interface_map,
            cpu_features: template.cpu_features,
            ssh_user: template.ssh_user,
            ssh_pass: template.ssh_pass,
            console_user: template.console_user,
            console_pass: template.console_pass,
            boot_timeout_secs: template.boot_timeout_secs,
            host: template.host,
            ssh_port: 0,
            console_port: 0,
            nics: vec![Nic::mgmt(crate::resolver::generate_mac(&vm_name, 0))],
        };

        for host in &hosts {
            nodes.remove(host);
        }
        nodes.insert(vm_name.clone(), synthetic);

        groups.push(HostVmGroup {
            vm_name,
            hosts,
            nic_base,
        });
    }

    (nodes, groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::InterfaceMap;

    fn host(name: &str, vm_host: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            platform: "sonic-vs".to_string(),
            device_type: ResolvedDeviceType::Host,
            image: "host.img".to_string(),
            memory: 2048,
            cpus: 1,
            nic_driver: "virtio".to_string(),
            interface_map: InterfaceMap::Linux,
            cpu_features: None,
            ssh_user: "admin".to_string(),
            ssh_pass: String::new(),
            console_user: "admin".to_string(),
            console_pass: String::new(),
            boot_timeout_secs: 180,
            host: vm_host.to_string(),
            ssh_port: 0,
            console_port: 0,
            nics: vec![Nic::mgmt(crate::resolver::generate_mac(name, 0))],
        }
    }

    #[test]
    fn folds_hosts_sharing_a_server() {
        let mut nodes = BTreeMap::new();
        nodes.insert("h1".to_string(), host("h1", "server-a"));
        nodes.insert("h2".to_string(), host("h2", "server-a"));

        let (nodes, groups) = coalesce_hosts(nodes, |_| 1);

        assert_eq!(groups.len(), 1);
        assert!(!nodes.contains_key("h1"));
        assert!(!nodes.contains_key("h2"));
        assert!(nodes.contains_key("hostvm-0"));
        let group = &groups[0];
        assert_eq!(group.hosts, vec!["h1".to_string(), "h2".to_string()]);
        assert_eq!(group.nic_base["h1"], 1);
        assert_eq!(group.nic_base["h2"], 2);
    }

    #[test]
    fn separate_pins_produce_separate_groups() {
        let mut nodes = BTreeMap::new();
        nodes.insert("h1".to_string(), host("h1", "server-a"));
        nodes.insert("h2".to_string(), host("h2", "server-b"));

        let (nodes, groups) = coalesce_hosts(nodes, |_| 1);
        assert_eq!(groups.len(), 2);
        assert!(nodes.contains_key("hostvm-0"));
        assert!(nodes.contains_key("hostvm-1"));
    }

    #[test]
    fn no_hosts_is_a_no_op() {
        let nodes: BTreeMap<String, NodeConfig> = BTreeMap::new();
        let (nodes, groups) = coalesce_hosts(nodes, |_| 0);
        assert!(nodes.is_empty());
        assert!(groups.is_empty());
    }
}
