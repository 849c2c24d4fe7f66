//! Range-based traffic selectors.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// IP protocol numbers with special selector semantics.
pub const IPPROTO_ANY: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Check if `proto` carries ICMP type/code in its port fields.
pub fn is_icmp(proto: u8) -> bool {
    proto == IPPROTO_ICMP || proto == IPPROTO_ICMPV6
}

/// Short protocol name for dumps.
pub fn protocol_name(proto: u8) -> String {
    match proto {
        IPPROTO_ANY => "ANY".into(),
        IPPROTO_ICMP => "ICMP".into(),
        IPPROTO_TCP => "TCP".into(),
        IPPROTO_UDP => "UDP".into(),
        IPPROTO_ICMPV6 => "ICMPv6".into(),
        other => other.to_string(),
    }
}

/// Inclusive port range. For ICMP the high byte is the type and the low
/// byte the code, as in IKEv2 traffic selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// Every port.
    pub const ANY: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };

    /// A single port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Check if this range covers every port.
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    fn contains(&self, other: &PortRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    fn intersect(&self, other: &PortRange) -> Option<PortRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(PortRange { start, end })
    }
}

/// Address width in bits for the family of `addr`.
pub(crate) fn family_bits(addr: &IpAddr) -> u32 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

pub(crate) fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn u128_to_addr(v: u128, like: &IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(v as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(v)),
    }
}

fn low_mask(bits: u32) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

/// Network address of `addr/prefix`.
pub fn network(addr: &IpAddr, prefix: u8) -> IpAddr {
    let bits = family_bits(addr);
    let host_bits = bits.saturating_sub(prefix as u32);
    let v = addr_to_u128(addr) & !low_mask(host_bits);
    u128_to_addr(v, addr)
}

/// A traffic selector: address range, port range and transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrafficSelector {
    /// IP protocol (0 = any).
    pub ip_protocol: u8,
    /// Port (or ICMP type/code) range.
    pub ports: PortRange,
    /// First address.
    pub start_addr: IpAddr,
    /// Last address.
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    /// Selector covering `addr/prefix`.
    pub fn from_prefix(addr: IpAddr, prefix: u8, ip_protocol: u8, ports: PortRange) -> Self {
        let bits = family_bits(&addr);
        let host_bits = bits.saturating_sub(prefix as u32);
        let start = addr_to_u128(&addr) & !low_mask(host_bits);
        let end = start | (low_mask(host_bits) & low_mask(bits));
        Self {
            ip_protocol,
            ports,
            start_addr: u128_to_addr(start, &addr),
            end_addr: u128_to_addr(end, &addr),
        }
    }

    /// Selector for one host, any protocol, any port.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            ip_protocol: IPPROTO_ANY,
            ports: PortRange::ANY,
            start_addr: addr,
            end_addr: addr,
        }
    }

    /// Selector covering the whole address family of `like`.
    pub fn any(like: IpAddr) -> Self {
        Self::from_prefix(like, 0, IPPROTO_ANY, PortRange::ANY)
    }

    /// Check if both ends belong to the same family and are ordered.
    pub fn is_valid(&self) -> bool {
        self.start_addr.is_ipv4() == self.end_addr.is_ipv4()
            && addr_to_u128(&self.start_addr) <= addr_to_u128(&self.end_addr)
            && self.ports.start <= self.ports.end
    }

    fn same_family(&self, other: &TrafficSelector) -> bool {
        self.start_addr.is_ipv4() == other.start_addr.is_ipv4()
    }

    /// Check if this selector is a superset of `other`.
    pub fn contains(&self, other: &TrafficSelector) -> bool {
        if !self.same_family(other) {
            return false;
        }
        if self.ip_protocol != IPPROTO_ANY && self.ip_protocol != other.ip_protocol {
            return false;
        }
        addr_to_u128(&self.start_addr) <= addr_to_u128(&other.start_addr)
            && addr_to_u128(&other.end_addr) <= addr_to_u128(&self.end_addr)
            && self.ports.contains(&other.ports)
    }

    /// Intersection of two selectors, if non-empty.
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if !self.same_family(other) {
            return None;
        }
        let ip_protocol = match (self.ip_protocol, other.ip_protocol) {
            (IPPROTO_ANY, p) | (p, IPPROTO_ANY) => p,
            (a, b) if a == b => a,
            _ => return None,
        };
        let start = addr_to_u128(&self.start_addr).max(addr_to_u128(&other.start_addr));
        let end = addr_to_u128(&self.end_addr).min(addr_to_u128(&other.end_addr));
        if start > end {
            return None;
        }
        let ports = self.ports.intersect(&other.ports)?;
        Some(TrafficSelector {
            ip_protocol,
            ports,
            start_addr: u128_to_addr(start, &self.start_addr),
            end_addr: u128_to_addr(end, &self.start_addr),
        })
    }

    /// Minimal list of `(network, prefix)` blocks covering the address range.
    pub fn to_prefixes(&self) -> Vec<(IpAddr, u8)> {
        let bits = family_bits(&self.start_addr);
        let mut start = addr_to_u128(&self.start_addr);
        let end = addr_to_u128(&self.end_addr);
        let mut out = Vec::new();
        if start > end {
            return out;
        }
        loop {
            let mut size = start.trailing_zeros().min(bits);
            while size > 0 && (start | low_mask(size)) > end {
                size -= 1;
            }
            let last = start | low_mask(size);
            out.push((u128_to_addr(start, &self.start_addr), (bits - size) as u8));
            if last >= end {
                break;
            }
            start = last + 1;
        }
        out
    }

    /// Prefix length if the address range is exactly one CIDR block.
    pub fn as_prefix(&self) -> Option<(IpAddr, u8)> {
        match self.to_prefixes().as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_prefix() {
            Some((net, prefix)) => write!(f, "{}/{}", net, prefix)?,
            None => write!(f, "{}-{}", self.start_addr, self.end_addr)?,
        }
        write!(f, "[{}", protocol_name(self.ip_protocol))?;
        if !self.ports.is_any() {
            write!(f, ":{}-{}", self.ports.start, self.ports.end)?;
        }
        write!(f, "]")
    }
}
