//! Resolved, in-memory plan types (§3: `NodeConfig`, `LinkConfig`,
//! `HostVMGroup`). Built once by `NewLab` and consumed for the lifetime of
//! one lab operation; never persisted directly (see `state` for the
//! long-lived document).

use crate::naming::InterfaceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDeviceType {
    Switch,
    Host,
    HostVm,
}

#[derive(Debug, Clone)]
pub struct Nic {
    pub index: u32,
    pub netdev_id: String,
    pub interface: String,
    pub connect_addr: Option<String>,
    pub mac: String,
}

impl Nic {
    pub fn mgmt(mac: String) -> Self {
        Nic {
            index: 0,
            netdev_id: "eth0".to_string(),
            interface: "mgmt".to_string(),
            connect_addr: None,
            mac,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub platform: String,
    pub device_type: ResolvedDeviceType,
    pub image: String,
    pub memory: u64,
    pub cpus: u32,
    pub nic_driver: String,
    pub interface_map: InterfaceMap,
    pub cpu_features: Option<String>,
    pub ssh_user: String,
    pub ssh_pass: String,
    pub console_user: String,
    pub console_pass: String,
    pub boot_timeout_secs: u64,
    /// Empty string means local (the operator host).
    pub host: String,
    pub ssh_port: u16,
    pub console_port: u16,
    pub nics: Vec<Nic>,
}

impl NodeConfig {
    pub fn is_local(&self) -> bool {
        self.host.is_empty()
    }

    pub fn next_nic_index(&self) -> u32 {
        self.nics.iter().map(|n| n.index).max().unwrap_or(0) + 1
    }
}

#[derive(Debug, Clone)]
pub struct LinkEndpoint {
    pub device: String,
    pub interface: String,
    pub nic_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    Loopback,
    Any,
}

impl Bind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bind::Loopback => "127.0.0.1",
            Bind::Any => "0.0.0.0",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub a: LinkEndpoint,
    pub z: LinkEndpoint,
    pub a_port: u16,
    pub z_port: u16,
    pub a_bind: Bind,
    pub z_bind: Bind,
    pub worker_host: String,
}

/// Records how host devices sharing a physical server were folded into one
/// synthetic multi-NIC VM (C3).
#[derive(Debug, Clone)]
pub struct HostVmGroup {
    pub vm_name: String,
    pub hosts: Vec<String>,
    pub nic_base: std::collections::HashMap<String, u32>,
}

/// The full resolved plan produced by `NewLab`: nodes keyed by name plus the
/// ordered link list and any coalescing that occurred.
#[derive(Debug, Clone, Default)]
pub struct LabPlan {
    pub nodes: std::collections::BTreeMap<String, NodeConfig>,
    pub links: Vec<LinkConfig>,
    pub host_groups: Vec<HostVmGroup>,
}
