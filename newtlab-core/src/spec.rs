//! Input data types.
//!
//! These are produced by the out-of-scope JSON file readers for topology,
//! platforms, and profiles (spec.md §1, §3). The engine only consumes them;
//! it never parses the files itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    pub devices: HashMap<String, DeviceSpec>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub orchestration: Option<Orchestration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub a: String,
    pub z: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orchestration {
    #[serde(default = "default_link_port_base")]
    pub link_port_base: u16,
    #[serde(default = "default_console_port_base")]
    pub console_port_base: u16,
    #[serde(default = "default_ssh_port_base")]
    pub ssh_port_base: u16,
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

fn default_link_port_base() -> u16 {
    20000
}
fn default_console_port_base() -> u16 {
    30000
}
fn default_ssh_port_base() -> u16 {
    40000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub max_nodes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceMapScheme {
    Sequential,
    #[serde(rename = "stride-4")]
    Stride4,
    Linux,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Switch,
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSpec {
    #[serde(default)]
    pub vm_image: Option<String>,
    #[serde(default)]
    pub vm_memory: Option<u64>,
    #[serde(default)]
    pub vm_cpus: Option<u32>,
    #[serde(default)]
    pub vm_nic_driver: Option<String>,
    #[serde(default)]
    pub vm_interface_map: Option<InterfaceMapScheme>,
    #[serde(default)]
    pub vm_interface_map_table: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub vm_cpu_features: Option<String>,
    #[serde(default)]
    pub vm_credentials: Option<Credentials>,
    #[serde(default)]
    pub vm_boot_timeout: Option<u64>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub hw_sku: Option<String>,
    #[serde(default)]
    pub default_speed: Option<String>,
    #[serde(default)]
    pub dataplane: Option<String>,
    #[serde(default)]
    pub vm_image_release: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub platform: String,
    #[serde(default)]
    pub vm_image: Option<String>,
    #[serde(default)]
    pub vm_memory: Option<u64>,
    #[serde(default)]
    pub vm_cpus: Option<u32>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_pass: Option<String>,
    #[serde(default)]
    pub vm_host: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_gateway: Option<String>,

    // Persisted fields: written by Deploy, restored by Destroy.
    #[serde(default)]
    pub mgmt_ip: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub console_port: Option<u16>,
}
