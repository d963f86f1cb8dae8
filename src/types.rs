//! Host data model.
//!
//! These are the values replicated by the store: host identities, attachment
//! points, the descriptors produced by discovery providers and the stored,
//! timestamped hosts. Everything here is an immutable value; updates produce
//! new values.
use crate::clock::Timestamp;
use crate::error::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create a MAC address from its six octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = HostError;

    /// Parse `AA:BB:CC:DD:EE:01` (dash separators and lowercase accepted).
    fn from_str(s: &str) -> HostResult<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(HostError::invalid(format!("malformed MAC address '{}'", s)));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(HostError::invalid(format!("malformed MAC address '{}'", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| HostError::invalid(format!("malformed MAC address '{}'", s)))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// VLAN membership of a host: untagged, or a 12-bit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VlanId {
    /// Untagged traffic.
    None,
    /// 802.1Q tag in `1..=4094`.
    Tag(u16),
}

impl VlanId {
    /// Highest usable 802.1Q tag.
    pub const MAX_TAG: u16 = 4094;

    /// Create a tagged VLAN id, rejecting reserved values.
    pub fn tag(id: u16) -> HostResult<Self> {
        if id == 0 || id > Self::MAX_TAG {
            return Err(HostError::invalid(format!("VLAN tag {} out of range", id)));
        }
        Ok(Self::Tag(id))
    }

    /// Check that a (possibly deserialized) value is in range.
    pub fn validate(&self) -> HostResult<()> {
        match *self {
            Self::None => Ok(()),
            Self::Tag(id) => Self::tag(id).map(|_| ()),
        }
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Tag(id) => write!(f, "{}", id),
        }
    }
}

/// Stable identity of an end-host, derived from MAC and VLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId {
    /// MAC address of the host.
    pub mac: MacAddress,
    /// VLAN the host was seen on.
    pub vlan: VlanId,
}

impl HostId {
    /// Create a host identity.
    pub fn new(mac: MacAddress, vlan: VlanId) -> Self {
        Self { mac, vlan }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mac, self.vlan)
    }
}

/// Identity of the discovery provider that described a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider id (e.g. `"of:arp"`).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an infrastructure device (switch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id (e.g. `"of:0000000000000001"`).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The device id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Port number on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortNumber(pub u64);

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attachment point of a host: a port on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectPoint {
    /// Device the host is attached to.
    pub device_id: DeviceId,
    /// Port on that device.
    pub port: PortNumber,
}

impl ConnectPoint {
    /// Create an attachment point.
    pub fn new(device_id: DeviceId, port: u64) -> Self {
        Self {
            device_id,
            port: PortNumber(port),
        }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.port)
    }
}

/// Free-form key/value annotations attached to a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations(BTreeMap<String, String>);

impl Annotations {
    /// Create an empty annotation set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Key-wise merge; keys present in `incoming` win.
    pub fn merge(&self, incoming: &Annotations) -> Annotations {
        let mut merged = self.0.clone();
        for (key, value) in &incoming.0 {
            merged.insert(key.clone(), value.clone());
        }
        Annotations(merged)
    }
}

/// What a discovery provider observed about a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// MAC address of the host.
    pub mac: MacAddress,
    /// VLAN the host was seen on.
    pub vlan: VlanId,
    /// Where the host was seen.
    pub location: ConnectPoint,
    /// Addresses observed for the host.
    #[serde(default)]
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Provider-specific annotations.
    #[serde(default)]
    pub annotations: Annotations,
    /// Replace the stored IP set instead of taking the union.
    #[serde(default)]
    pub replace_ips: bool,
}

impl HostDescriptor {
    /// Create a descriptor with no addresses and no annotations.
    pub fn new(mac: MacAddress, vlan: VlanId, location: ConnectPoint) -> Self {
        Self {
            mac,
            vlan,
            location,
            ip_addresses: BTreeSet::new(),
            annotations: Annotations::new(),
            replace_ips: false,
        }
    }

    /// Add an IP address.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.insert(ip);
        self
    }

    /// Add several IP addresses.
    pub fn with_ips(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ip_addresses.extend(ips);
        self
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations = self.annotations.with(key, value);
        self
    }

    /// Request that the IP set replaces the stored one.
    pub fn replacing_ips(mut self) -> Self {
        self.replace_ips = true;
        self
    }

    /// The host identity this descriptor describes.
    pub fn host_id(&self) -> HostId {
        HostId::new(self.mac, self.vlan)
    }

    /// Reject descriptors that cannot be applied to `host_id`.
    pub fn validate(&self, provider_id: &ProviderId, host_id: &HostId) -> HostResult<()> {
        if provider_id.as_str().is_empty() {
            return Err(HostError::invalid("provider id must not be empty"));
        }
        if self.location.device_id.as_str().is_empty() {
            return Err(HostError::invalid(format!(
                "host {} has no attachment device",
                host_id
            )));
        }
        self.vlan.validate()?;
        if self.host_id() != *host_id {
            return Err(HostError::invalid(format!(
                "descriptor for {} does not match host id {}",
                self.host_id(),
                host_id
            )));
        }
        Ok(())
    }
}

/// An end-host as known to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Provider whose observation produced this state.
    pub provider_id: ProviderId,
    /// Identity of the host.
    pub id: HostId,
    /// MAC address of the host.
    pub mac: MacAddress,
    /// VLAN of the host.
    pub vlan: VlanId,
    /// Current attachment point.
    pub location: ConnectPoint,
    /// Known IP addresses.
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Merged annotations.
    pub annotations: Annotations,
}

impl Host {
    /// Build a host straight from a descriptor.
    pub fn from_descriptor(provider_id: ProviderId, id: HostId, descr: &HostDescriptor) -> Self {
        Self {
            provider_id,
            id,
            mac: descr.mac,
            vlan: descr.vlan,
            location: descr.location.clone(),
            ip_addresses: descr.ip_addresses.clone(),
            annotations: descr.annotations.clone(),
        }
    }

    /// Descriptor carrying this host's full state. Its IP set is unioned into
    /// whatever the receiver holds; replacement only travels with the
    /// original observation.
    pub fn to_descriptor(&self) -> HostDescriptor {
        HostDescriptor {
            mac: self.mac,
            vlan: self.vlan,
            location: self.location.clone(),
            ip_addresses: self.ip_addresses.clone(),
            annotations: self.annotations.clone(),
            replace_ips: false,
        }
    }

    /// Compare observable state, ignoring which provider reported it.
    pub fn same_state(&self, other: &Host) -> bool {
        self.location == other.location
            && self.ip_addresses == other.ip_addresses
            && self.annotations == other.annotations
    }
}

/// A host together with the timestamp of the state it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHost {
    host: Host,
    timestamp: Timestamp,
}

impl StoredHost {
    /// Stamp a host.
    pub fn new(host: Host, timestamp: Timestamp) -> Self {
        Self { host, timestamp }
    }

    /// The host value.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// When this state was produced.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Provenance of this entry.
    pub fn fragment_id(&self) -> FragmentId {
        FragmentId::new(self.host.id, self.host.provider_id.clone())
    }

    /// Check whether an incoming `(timestamp, provider)` version is strictly
    /// newer than this entry. Equal timestamps fall back to the provider id.
    pub fn is_superseded_by(&self, timestamp: Timestamp, provider_id: &ProviderId) -> bool {
        (timestamp, provider_id) > (self.timestamp, &self.host.provider_id)
    }

    /// Unwrap the host value.
    pub fn into_host(self) -> Host {
        self.host
    }
}

/// Provenance unit exchanged during anti-entropy: a host as described by one
/// provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId {
    /// The host.
    pub host_id: HostId,
    /// The provider that described it.
    pub provider_id: ProviderId,
}

impl FragmentId {
    /// Create a fragment id.
    pub fn new(host_id: HostId, provider_id: ProviderId) -> Self {
        Self {
            host_id,
            provider_id,
        }
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.host_id, self.provider_id)
    }
}
