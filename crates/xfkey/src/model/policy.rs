//! Kernel security policy mirror types.

use std::fmt::{self, Write as _};
use std::net::IpAddr;

use serde::Serialize;

use super::selector::{IPPROTO_ANY, PortRange, TrafficSelector, is_icmp, network, protocol_name};

/// Policy table the kernel keeps the entry in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PolicyType {
    /// Main policy table.
    Main,
    /// Sub-policy table (narrowed road-warrior policies).
    Sub,
}

/// Traffic direction a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Incoming traffic.
    In,
    /// Outgoing traffic.
    Out,
    /// Forwarded traffic.
    Forward,
}

impl Direction {
    /// Uppercase label used in dumps.
    pub fn label(&self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Forward => "FORWARD",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the kernel does with matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PolicyAction {
    /// Apply IPsec per the attached request.
    Protect,
    /// Pass in clear.
    Bypass,
    /// Drop.
    Discard,
}

impl PolicyAction {
    fn label(&self) -> &'static str {
        match self {
            Self::Protect => "PROTECT",
            Self::Bypass => "BYPASS",
            Self::Discard => "DISCARD",
        }
    }
}

/// IPsec encapsulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IpsecMode {
    /// Transport mode.
    Transport,
    /// Tunnel mode.
    Tunnel,
}

/// How strictly the kernel requires an SA for matching traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IpsecLevel {
    /// System default.
    Default,
    /// Use an SA if available.
    Use,
    /// Require an SA.
    Require,
    /// Require an SA bound to this policy only.
    Unique,
}

/// IPsec protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IpsecProtocol {
    /// Authentication Header.
    Ah,
    /// Encapsulating Security Payload.
    Esp,
}

impl IpsecProtocol {
    /// IP protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Esp => 50,
            Self::Ah => 51,
        }
    }

    /// Parse an IP protocol number.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            50 => Some(Self::Esp),
            51 => Some(Self::Ah),
            _ => None,
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Esp => "ESP",
            Self::Ah => "AH",
        })
    }
}

/// Outer tunnel endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelEndpoints {
    /// Tunnel source.
    pub src: IpAddr,
    /// Tunnel destination.
    pub dst: IpAddr,
}

/// Security requirement attached to a policy.
///
/// Tunnel endpoints exist iff the mode is [`IpsecMode::Tunnel`]; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, Serialize)]
pub struct SaRequest {
    tunnel: Option<TunnelEndpoints>,
    /// Request id (reqid) binding SAs to this requirement.
    pub request_id: u32,
    /// Requirement level.
    pub level: IpsecLevel,
    /// IPsec protocol.
    pub protocol: IpsecProtocol,
}

impl SaRequest {
    /// Transport-mode requirement.
    pub fn transport(protocol: IpsecProtocol, level: IpsecLevel, request_id: u32) -> Self {
        Self {
            tunnel: None,
            request_id,
            level,
            protocol,
        }
    }

    /// Tunnel-mode requirement between `src` and `dst`.
    pub fn tunnel(
        protocol: IpsecProtocol,
        level: IpsecLevel,
        request_id: u32,
        src: IpAddr,
        dst: IpAddr,
    ) -> Self {
        Self {
            tunnel: Some(TunnelEndpoints { src, dst }),
            request_id,
            level,
            protocol,
        }
    }

    /// Encapsulation mode.
    pub fn mode(&self) -> IpsecMode {
        if self.tunnel.is_some() {
            IpsecMode::Tunnel
        } else {
            IpsecMode::Transport
        }
    }

    /// Tunnel endpoints (tunnel mode only).
    pub fn tunnel_endpoints(&self) -> Option<TunnelEndpoints> {
        self.tunnel
    }

    /// Replace the tunnel endpoints, keeping the mode.
    pub(crate) fn set_tunnel_endpoints(&mut self, endpoints: TunnelEndpoints) {
        if self.tunnel.is_some() {
            self.tunnel = Some(endpoints);
        }
    }

    fn write_tab(&self, out: &mut String, tab: &str) {
        let _ = writeln!(out, "{tab}<SA_REQUEST>");
        let _ = writeln!(out, "{tab}\tprotocol={}", self.protocol);
        let _ = writeln!(out, "{tab}\tmode={:?}", self.mode());
        let _ = writeln!(out, "{tab}\tlevel={:?}", self.level);
        let _ = writeln!(out, "{tab}\trequest_id={}", self.request_id);
        if let Some(t) = self.tunnel {
            let _ = writeln!(out, "{tab}\ttunnel_src={}", t.src);
            let _ = writeln!(out, "{tab}\ttunnel_dst={}", t.dst);
        }
    }
}

impl PartialEq for SaRequest {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.protocol == other.protocol && self.tunnel == other.tunnel
    }
}

impl Eq for SaRequest {}

/// Port fields of a policy: transport ports, or ICMP type/code when the
/// policy's protocol is ICMP/ICMPv6. Zero means "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Ports {
    /// TCP/UDP/... ports.
    Transport {
        /// Source port.
        src: u16,
        /// Destination port.
        dst: u16,
    },
    /// ICMP type and code.
    Icmp {
        /// ICMP type.
        kind: u8,
        /// ICMP code.
        code: u8,
    },
}

impl Ports {
    /// Interpret raw kernel port fields for `ip_protocol`.
    pub fn from_raw(ip_protocol: u8, src: u16, dst: u16) -> Self {
        if is_icmp(ip_protocol) {
            Ports::Icmp {
                kind: src as u8,
                code: dst as u8,
            }
        } else {
            Ports::Transport { src, dst }
        }
    }

    /// Raw kernel port fields (source, destination).
    pub fn raw(&self) -> (u16, u16) {
        match *self {
            Ports::Transport { src, dst } => (src, dst),
            Ports::Icmp { kind, code } => (kind as u16, code as u16),
        }
    }
}

/// One kernel security policy.
#[derive(Debug, Clone, Serialize)]
pub struct Policy {
    /// Kernel policy id (XFRM index / PF_KEY policy id).
    pub id: u32,
    /// Policy table.
    pub policy_type: PolicyType,
    /// Direction.
    pub direction: Direction,
    /// Action on matching traffic.
    pub action: PolicyAction,
    /// Kernel priority (lower wins).
    pub priority: u32,
    /// Source selector address.
    pub src_addr: IpAddr,
    /// Source selector prefix length.
    pub src_prefix: u8,
    /// Destination selector address.
    pub dst_addr: IpAddr,
    /// Destination selector prefix length.
    pub dst_prefix: u8,
    ip_protocol: u8,
    ports: Ports,
    /// Attached requirement; `None` for bypass/discard policies.
    pub sa_request: Option<SaRequest>,
    /// Created for on-demand SA setup of road-warrior clients.
    pub autogen: bool,
}

impl Policy {
    /// A MAIN policy between two selectors, any protocol, any port.
    pub fn new(direction: Direction, src: (IpAddr, u8), dst: (IpAddr, u8)) -> Self {
        Self {
            id: 0,
            policy_type: PolicyType::Main,
            direction,
            action: PolicyAction::Bypass,
            priority: 0,
            src_addr: network(&src.0, src.1),
            src_prefix: src.1,
            dst_addr: network(&dst.0, dst.1),
            dst_prefix: dst.1,
            ip_protocol: IPPROTO_ANY,
            ports: Ports::Transport { src: 0, dst: 0 },
            sa_request: None,
            autogen: false,
        }
    }

    /// Attach a requirement; the action becomes [`PolicyAction::Protect`].
    pub fn with_request(mut self, request: SaRequest) -> Self {
        self.sa_request = Some(request);
        self.action = PolicyAction::Protect;
        self
    }

    /// Set the transport protocol and raw port fields together.
    pub fn with_protocol(mut self, ip_protocol: u8, src_port: u16, dst_port: u16) -> Self {
        self.ip_protocol = ip_protocol;
        self.ports = Ports::from_raw(ip_protocol, src_port, dst_port);
        self
    }

    /// IP transport protocol.
    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    /// Port fields under the active interpretation.
    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Change the transport protocol, reinterpreting the port fields.
    ///
    /// Switching to ICMP keeps the low byte of each port as type/code.
    pub fn set_ip_protocol(&mut self, ip_protocol: u8) {
        let (src, dst) = self.ports.raw();
        self.ip_protocol = ip_protocol;
        self.ports = Ports::from_raw(ip_protocol, src, dst);
    }

    /// ICMP type, if this is an ICMP policy.
    pub fn icmp_type(&self) -> Option<u8> {
        match self.ports {
            Ports::Icmp { kind, .. } => Some(kind),
            Ports::Transport { .. } => None,
        }
    }

    /// ICMP code, if this is an ICMP policy.
    pub fn icmp_code(&self) -> Option<u8> {
        match self.ports {
            Ports::Icmp { code, .. } => Some(code),
            Ports::Transport { .. } => None,
        }
    }

    fn port_range(port: u16) -> PortRange {
        if port == 0 {
            PortRange::ANY
        } else {
            PortRange::single(port)
        }
    }

    fn icmp_range(kind: u8, code: u8) -> PortRange {
        match (kind, code) {
            (0, 0) => PortRange::ANY,
            (k, 0) => PortRange {
                start: (k as u16) << 8,
                end: ((k as u16) << 8) | 0xff,
            },
            (k, c) => PortRange::single(((k as u16) << 8) | c as u16),
        }
    }

    /// Source traffic selector derived from this policy.
    pub fn src_traffic_selector(&self) -> TrafficSelector {
        let ports = match self.ports {
            Ports::Transport { src, .. } => Self::port_range(src),
            Ports::Icmp { kind, code } => Self::icmp_range(kind, code),
        };
        TrafficSelector::from_prefix(self.src_addr, self.src_prefix, self.ip_protocol, ports)
    }

    /// Destination traffic selector derived from this policy.
    pub fn dst_traffic_selector(&self) -> TrafficSelector {
        let ports = match self.ports {
            Ports::Transport { dst, .. } => Self::port_range(dst),
            // ICMP type/code describe the packet, not an endpoint.
            Ports::Icmp { kind, code } => Self::icmp_range(kind, code),
        };
        TrafficSelector::from_prefix(self.dst_addr, self.dst_prefix, self.ip_protocol, ports)
    }

    /// Check if both address the same kernel SPD entry: same table,
    /// direction, addresses, protocol and ports, whatever the SA request.
    pub fn same_selector(&self, other: &Policy) -> bool {
        self.policy_type == other.policy_type
            && self.direction == other.direction
            && self.ip_protocol == other.ip_protocol
            && self.src_addr == other.src_addr
            && self.src_prefix == other.src_prefix
            && self.dst_addr == other.dst_addr
            && self.dst_prefix == other.dst_prefix
            && self.ports == other.ports
    }

    /// Multi-line dump, each line prefixed by `indent` tabs.
    pub fn to_string_tab(&self, indent: usize) -> String {
        let tab = "\t".repeat(indent);
        let mut out = String::new();
        let _ = writeln!(out, "{tab}<POLICY>");
        let _ = writeln!(out, "{tab}\tid={}", self.id);
        let _ = writeln!(
            out,
            "{tab}\ttype={}",
            match self.policy_type {
                PolicyType::Main => "MAIN",
                PolicyType::Sub => "SUB",
            }
        );
        let _ = writeln!(out, "{tab}\tdirection={}", self.direction);
        let _ = writeln!(out, "{tab}\taction={}", self.action.label());
        let _ = writeln!(out, "{tab}\tpriority={}", self.priority);
        let _ = writeln!(out, "{tab}\tsrc_selector={}/{}", self.src_addr, self.src_prefix);
        let _ = writeln!(out, "{tab}\tdst_selector={}/{}", self.dst_addr, self.dst_prefix);
        let _ = writeln!(out, "{tab}\tip_protocol={}", protocol_name(self.ip_protocol));
        match self.ports {
            Ports::Transport { src, dst } => {
                let _ = writeln!(out, "{tab}\tsrc_port={}", src);
                let _ = writeln!(out, "{tab}\tdst_port={}", dst);
            }
            Ports::Icmp { kind, code } => {
                let _ = writeln!(out, "{tab}\ticmp_type={}", kind);
                let _ = writeln!(out, "{tab}\ticmp_code={}", code);
            }
        }
        if self.autogen {
            let _ = writeln!(out, "{tab}\tautogen=true");
        }
        match &self.sa_request {
            Some(req) => req.write_tab(&mut out, &format!("{tab}\t")),
            None => {
                let _ = writeln!(out, "{tab}\tsa_request=NONE");
            }
        }
        out
    }
}

impl PartialEq for Policy {
    fn eq(&self, other: &Self) -> bool {
        self.same_selector(other) && self.sa_request == other.sa_request
    }
}

impl Eq for Policy {}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "policy {} {} {}/{} -> {}/{} proto {}",
            self.id,
            self.direction,
            self.src_addr,
            self.src_prefix,
            self.dst_addr,
            self.dst_prefix,
            protocol_name(self.ip_protocol)
        )
    }
}
