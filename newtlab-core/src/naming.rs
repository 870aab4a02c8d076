//! Interface naming and NIC index translation (C1).
//!
//! The management NIC is always index 0 and is never produced or consumed by
//! these mappings; index 0 is reserved by convention at the `NodeConfig`
//! level (see `resolver`).

use std::collections::HashMap;

use crate::error::{LabError, Result};
use crate::spec::InterfaceMapScheme;

#[derive(Debug, Clone)]
pub enum InterfaceMap {
    Sequential,
    Stride4,
    Linux,
    Custom(HashMap<String, u32>),
}

impl InterfaceMap {
    pub fn from_scheme(scheme: InterfaceMapScheme, table: Option<HashMap<String, u32>>) -> Self {
        match scheme {
            InterfaceMapScheme::Sequential => InterfaceMap::Sequential,
            InterfaceMapScheme::Stride4 => InterfaceMap::Stride4,
            InterfaceMapScheme::Linux => InterfaceMap::Linux,
            InterfaceMapScheme::Custom => InterfaceMap::Custom(table.unwrap_or_default()),
        }
    }

    fn scheme_name(&self) -> &'static str {
        match self {
            InterfaceMap::Sequential => "sequential",
            InterfaceMap::Stride4 => "stride-4",
            InterfaceMap::Linux => "linux",
            InterfaceMap::Custom(_) => "custom",
        }
    }

    fn invalid(&self, interface: &str, reason: impl Into<String>) -> LabError {
        LabError::InvalidInterface {
            scheme: self.scheme_name().to_string(),
            interface: interface.to_string(),
            reason: reason.into(),
        }
    }

    /// Translate an interface name (`EthernetK`, `ethK`, or a custom name)
    /// into a one-based data-NIC index.
    pub fn resolve_nic_index(&self, interface: &str) -> Result<u32> {
        match self {
            InterfaceMap::Sequential => {
                let k = parse_suffix(interface, "Ethernet")
                    .ok_or_else(|| self.invalid(interface, "expected EthernetK"))?;
                Ok(k + 1)
            }
            InterfaceMap::Stride4 => {
                let k = parse_suffix(interface, "Ethernet")
                    .ok_or_else(|| self.invalid(interface, "expected EthernetK"))?;
                if k % 4 != 0 {
                    return Err(self.invalid(interface, "index not aligned to stride 4"));
                }
                Ok(k / 4 + 1)
            }
            InterfaceMap::Linux => {
                parse_suffix(interface, "eth").ok_or_else(|| self.invalid(interface, "expected ethK"))
            }
            InterfaceMap::Custom(table) => table
                .get(interface)
                .copied()
                .ok_or_else(|| self.invalid(interface, "no entry in custom table")),
        }
    }

    /// Translate a one-based data-NIC index back into an interface name.
    pub fn resolve_interface_name(&self, nic_index: u32) -> Result<String> {
        match self {
            InterfaceMap::Sequential => {
                if nic_index == 0 {
                    return Err(self.invalid("(nic 0)", "index 0 is the management NIC"));
                }
                Ok(format!("Ethernet{}", nic_index - 1))
            }
            InterfaceMap::Stride4 => {
                if nic_index == 0 {
                    return Err(self.invalid("(nic 0)", "index 0 is the management NIC"));
                }
                Ok(format!("Ethernet{}", (nic_index - 1) * 4))
            }
            InterfaceMap::Linux => Ok(format!("eth{nic_index}")),
            InterfaceMap::Custom(table) => table
                .iter()
                .find(|(_, v)| **v == nic_index)
                .map(|(k, _)| k.clone())
                .ok_or_else(|| self.invalid("(nic index)", "no entry in custom table")),
        }
    }
}

fn parse_suffix(interface: &str, prefix: &str) -> Option<u32> {
    interface.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_roundtrips() {
        let m = InterfaceMap::Sequential;
        assert_eq!(m.resolve_nic_index("Ethernet0").unwrap(), 1);
        assert_eq!(m.resolve_interface_name(1).unwrap(), "Ethernet0");
    }

    #[test]
    fn stride4_roundtrips_and_rejects_unaligned() {
        let m = InterfaceMap::Stride4;
        assert_eq!(m.resolve_nic_index("Ethernet4").unwrap(), 2);
        assert_eq!(m.resolve_interface_name(2).unwrap(), "Ethernet4");
        assert!(m.resolve_nic_index("Ethernet3").is_err());
    }

    #[test]
    fn linux_roundtrips() {
        let m = InterfaceMap::Linux;
        assert_eq!(m.resolve_nic_index("eth3").unwrap(), 3);
        assert_eq!(m.resolve_interface_name(3).unwrap(), "eth3");
    }

    #[test]
    fn custom_roundtrips_and_rejects_missing() {
        let mut table = HashMap::new();
        table.insert("fpPort1".to_string(), 1);
        let m = InterfaceMap::Custom(table);
        assert_eq!(m.resolve_nic_index("fpPort1").unwrap(), 1);
        assert_eq!(m.resolve_interface_name(1).unwrap(), "fpPort1");
        assert!(m.resolve_nic_index("fpPort2").is_err());
    }

    /// Property 4: for any scheme and index, ResolveInterfaceName(ResolveNICIndex(name)) == name.
    #[test]
    fn roundtrip_property_all_schemes() {
        for (m, names) in [
            (InterfaceMap::Sequential, vec!["Ethernet0", "Ethernet7"]),
            (InterfaceMap::Stride4, vec!["Ethernet0", "Ethernet8"]),
            (InterfaceMap::Linux, vec!["eth0", "eth5"]),
        ] {
            for name in names {
                let idx = m.resolve_nic_index(name).unwrap();
                assert_eq!(m.resolve_interface_name(idx).unwrap(), name);
            }
        }
    }
}
