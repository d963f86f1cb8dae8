//! Address bindings: the addresses configured on infrastructure ports.
//!
//! A binding says which interface addresses, MAC and VLAN the controller
//! answers with on a given port. Bindings are operator configuration local to
//! a replica; they are neither timestamped nor gossiped.
use crate::error::{HostError, HostResult};
use crate::types::{ConnectPoint, MacAddress, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

/// An interface address with its subnet prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// The address itself.
    pub ip: IpAddr,
    /// Subnet prefix length.
    pub prefix_len: u8,
}

impl InterfaceAddress {
    /// Create an interface address, rejecting prefixes too long for the
    /// address family.
    pub fn new(ip: IpAddr, prefix_len: u8) -> HostResult<Self> {
        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(HostError::invalid(format!(
                "prefix length {} exceeds {} for {}",
                prefix_len, max, ip
            )));
        }
        Ok(Self { ip, prefix_len })
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

/// Addresses bound to one port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortAddresses {
    /// The port.
    pub connect_point: ConnectPoint,
    /// Interface addresses on the port.
    pub addresses: BTreeSet<InterfaceAddress>,
    /// MAC address the port answers with, if any.
    pub mac: Option<MacAddress>,
    /// VLAN of the binding.
    pub vlan: VlanId,
}

impl PortAddresses {
    /// An empty binding for `connect_point`.
    pub fn new(connect_point: ConnectPoint) -> Self {
        Self {
            connect_point,
            addresses: BTreeSet::new(),
            mac: None,
            vlan: VlanId::None,
        }
    }

    /// Add an interface address.
    pub fn with_address(mut self, address: InterfaceAddress) -> Self {
        self.addresses.insert(address);
        self
    }

    /// Set the MAC address.
    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Set the VLAN.
    pub fn with_vlan(mut self, vlan: VlanId) -> Self {
        self.vlan = vlan;
        self
    }

    /// Reject bindings that cannot be stored.
    pub fn validate(&self) -> HostResult<()> {
        if self.connect_point.device_id.as_str().is_empty() {
            return Err(HostError::invalid("address binding has no device"));
        }
        self.vlan.validate()
    }
}

/// Multimap from port to the bindings configured on it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressBindings {
    ports: BTreeMap<ConnectPoint, BTreeSet<PortAddresses>>,
}

impl AddressBindings {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. Returns false if it was already present.
    pub fn add(&mut self, binding: PortAddresses) -> bool {
        self.ports
            .entry(binding.connect_point.clone())
            .or_default()
            .insert(binding)
    }

    /// Remove one binding. Returns false if it was not present.
    pub fn remove(&mut self, binding: &PortAddresses) -> bool {
        let Some(bound) = self.ports.get_mut(&binding.connect_point) else {
            return false;
        };
        let removed = bound.remove(binding);
        if bound.is_empty() {
            self.ports.remove(&binding.connect_point);
        }
        removed
    }

    /// Remove every binding on a port. Returns how many were removed.
    pub fn clear_port(&mut self, connect_point: &ConnectPoint) -> usize {
        self.ports.remove(connect_point).map_or(0, |bound| bound.len())
    }

    /// Bindings on one port.
    pub fn for_port(&self, connect_point: &ConnectPoint) -> Vec<PortAddresses> {
        self.ports
            .get(connect_point)
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every binding.
    pub fn all(&self) -> Vec<PortAddresses> {
        self.ports.values().flatten().cloned().collect()
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.ports.values().map(BTreeSet::len).sum()
    }

    /// Check if no binding exists.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.ports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;
    use std::net::Ipv4Addr;

    fn cp(port: u64) -> ConnectPoint {
        ConnectPoint::new(DeviceId::new("of:1"), port)
    }

    fn addr(last: u8) -> InterfaceAddress {
        InterfaceAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 24).unwrap()
    }

    #[test]
    fn test_interface_address_prefix() {
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(InterfaceAddress::new(v4, 32).is_ok());
        assert!(InterfaceAddress::new(v4, 33).is_err());
        assert_eq!(addr(1).to_string(), "10.0.0.1/24");
    }

    #[test]
    fn test_add_remove_and_clear() {
        let mut bindings = AddressBindings::new();
        let a = PortAddresses::new(cp(1)).with_address(addr(1));
        let b = PortAddresses::new(cp(1)).with_address(addr(2)).with_vlan(VlanId::Tag(10));
        let c = PortAddresses::new(cp(2)).with_address(addr(3));

        assert!(bindings.add(a.clone()));
        assert!(!bindings.add(a.clone()));
        bindings.add(b.clone());
        bindings.add(c.clone());
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings.for_port(&cp(1)), vec![a.clone(), b.clone()]);

        assert!(bindings.remove(&a));
        assert!(!bindings.remove(&a));
        assert_eq!(bindings.for_port(&cp(1)), vec![b]);

        assert_eq!(bindings.clear_port(&cp(1)), 1);
        assert!(bindings.for_port(&cp(1)).is_empty());
        assert_eq!(bindings.all(), vec![c]);

        bindings.clear();
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_validate() {
        let binding = PortAddresses::new(ConnectPoint::new(DeviceId::new(""), 1));
        assert!(binding.validate().is_err());
        assert!(PortAddresses::new(cp(1)).validate().is_ok());
    }
}
