//! Node resolution (C2): merge device profile ▸ platform ▸ built-in defaults
//! into a `NodeConfig`, and generate deterministic per-NIC MAC addresses.

use sha2::{Digest, Sha256};

use crate::error::{LabError, Result};
use crate::naming::InterfaceMap;
use crate::spec::{DeviceProfile, DeviceType, PlatformSpec};
use crate::types::{Nic, NodeConfig, ResolvedDeviceType};

const DEFAULT_MEMORY: u64 = 4096;
const DEFAULT_CPUS: u32 = 2;
const DEFAULT_NIC_DRIVER: &str = "e1000";
const DEFAULT_BOOT_TIMEOUT: u64 = 180;
const DEFAULT_SSH_USER: &str = "admin";

/// Deterministic MAC `52:54:00:XX:YY:ZZ` where `XX:YY:ZZ` are the first
/// three bytes of `SHA-256("<name>-<nic_index>")`. Stable across reboots and
/// across runs for the same name/index (property 5 / S5-adjacent).
pub fn generate_mac(name: &str, nic_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{name}-{nic_index}").as_bytes());
    let digest = hasher.finalize();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// Resolve one device into a `NodeConfig`. `profile.platform` selects the
/// `PlatformSpec` from the platform catalogue.
pub fn resolve_node(
    name: &str,
    profile: &DeviceProfile,
    platform: &PlatformSpec,
) -> Result<NodeConfig> {
    let image = profile
        .vm_image
        .clone()
        .or_else(|| platform.vm_image.clone())
        .ok_or_else(|| LabError::MissingImage {
            device: name.to_string(),
        })?;

    let memory = profile
        .vm_memory
        .or(platform.vm_memory)
        .unwrap_or(DEFAULT_MEMORY);
    let cpus = profile.vm_cpus.or(platform.vm_cpus).unwrap_or(DEFAULT_CPUS);
    let nic_driver = platform
        .vm_nic_driver
        .clone()
        .unwrap_or_else(|| DEFAULT_NIC_DRIVER.to_string());

    let scheme = platform
        .vm_interface_map
        .unwrap_or(crate::spec::InterfaceMapScheme::Stride4);
    let interface_map =
        InterfaceMap::from_scheme(scheme, platform.vm_interface_map_table.clone());

    let ssh_user = profile
        .ssh_user
        .clone()
        .or_else(|| platform.vm_credentials.as_ref().map(|c| c.user.clone()))
        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
    let ssh_pass = profile
        .ssh_pass
        .clone()
        .or_else(|| platform.vm_credentials.as_ref().map(|c| c.pass.clone()))
        .unwrap_or_default();

    // Console credentials are the image-baked login, distinct from the
    // post-bootstrap SSH account created on the guest (spec.md §4.10).
    let (console_user, console_pass) = platform
        .vm_credentials
        .as_ref()
        .map(|c| (c.user.clone(), c.pass.clone()))
        .unwrap_or_else(|| (DEFAULT_SSH_USER.to_string(), String::new()));

    let boot_timeout_secs = platform.vm_boot_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT);

    let device_type = match platform.device_type {
        Some(DeviceType::Host) => ResolvedDeviceType::Host,
        _ => ResolvedDeviceType::Switch,
    };

    let host = profile.vm_host.clone().unwrap_or_default();

    let mgmt_mac = generate_mac(name, 0);

    Ok(NodeConfig {
        name: name.to_string(),
        platform: profile.platform.clone(),
        device_type,
        image,
        memory,
        cpus,
        nic_driver,
        interface_map,
        cpu_features: platform.vm_cpu_features.clone(),
        ssh_user,
        ssh_pass,
        console_user,
        console_pass,
        boot_timeout_secs,
        host,
        ssh_port: 0,
        console_port: 0,
        nics: vec![Nic::mgmt(mgmt_mac)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Credentials;

    fn platform() -> PlatformSpec {
        PlatformSpec {
            vm_image: Some("sonic-vpp.img".to_string()),
            vm_credentials: Some(Credentials {
                user: "admin".to_string(),
                pass: "YourPaSsWoRd".to_string(),
            }),
            ..Default::default()
        }
    }

    fn profile() -> DeviceProfile {
        DeviceProfile {
            platform: "sonic-vpp".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn applies_builtin_defaults() {
        let node = resolve_node("spine1", &profile(), &platform()).unwrap();
        assert_eq!(node.memory, DEFAULT_MEMORY);
        assert_eq!(node.cpus, DEFAULT_CPUS);
        assert_eq!(node.nic_driver, "e1000");
        assert_eq!(node.boot_timeout_secs, 180);
        assert_eq!(node.ssh_user, "admin");
    }

    #[test]
    fn profile_overrides_platform() {
        let mut p = profile();
        p.vm_memory = Some(8192);
        let node = resolve_node("spine1", &p, &platform()).unwrap();
        assert_eq!(node.memory, 8192);
    }

    #[test]
    fn missing_image_fails() {
        let platform = PlatformSpec::default();
        let err = resolve_node("spine1", &profile(), &platform).unwrap_err();
        assert!(matches!(err, LabError::MissingImage { .. }));
    }

    #[test]
    fn nic_zero_is_mgmt_and_never_a_link_endpoint() {
        let node = resolve_node("spine1", &profile(), &platform()).unwrap();
        assert_eq!(node.nics.len(), 1);
        assert_eq!(node.nics[0].index, 0);
        assert_eq!(node.nics[0].interface, "mgmt");
    }

    /// Property 5: MAC starts with 52:54:00: and is stable across calls.
    #[test]
    fn mac_is_deterministic_and_well_formed() {
        let mac1 = generate_mac("spine1", 1);
        let mac2 = generate_mac("spine1", 1);
        assert_eq!(mac1, mac2);
        assert!(mac1.starts_with("52:54:00:"));
        assert_ne!(generate_mac("spine1", 1), generate_mac("spine1", 2));
        assert_ne!(generate_mac("spine1", 1), generate_mac("leaf1", 1));
    }
}
