//! The ingress rules `ipgate` reasons about, and the target it reconciles.

use serde::Serialize;
use std::net::Ipv4Addr;

/// Transport protocol of an ingress rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl Protocol {
    /// The name EC2 uses for this protocol in `IpProtocol`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "6" => Ok(Protocol::Tcp),
            "udp" | "17" => Ok(Protocol::Udp),
            p => Err(format!("unsupported protocol {}", p)),
        }
    }
}

/// A single (protocol, port range, source CIDR) ingress permission.
///
/// Two rules are the same rule iff all four fields match. The derived ordering exists so rule
/// sets iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    /// A rule admitting `cidr` on exactly one port.
    pub fn new(protocol: Protocol, port: u16, cidr: impl Into<String>) -> Self {
        IngressRule {
            protocol,
            from_port: port,
            to_port: port,
            cidr: cidr.into(),
        }
    }

    /// True if this rule covers exactly `port` over `protocol`.
    pub fn matches(&self, port: u16, protocol: Protocol) -> bool {
        self.protocol == protocol && self.from_port == port && self.to_port == port
    }

    /// The description attached to rules that `ipgate` creates.
    pub fn description(&self) -> String {
        format!(
            "access from {} on port {}/{}",
            self.cidr, self.from_port, self.protocol
        )
    }
}

impl std::fmt::Display for IngressRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from_port == self.to_port {
            write!(f, "{}/{} from {}", self.protocol, self.from_port, self.cidr)
        } else {
            write!(
                f,
                "{}/{}-{} from {}",
                self.protocol, self.from_port, self.to_port, self.cidr
            )
        }
    }
}

/// Whether reconciliation may remove other sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Revoke every other source on the port, leaving exactly the desired CIDR.
    Strict,
    /// Only ensure the desired CIDR is present. Never revokes.
    Additive,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Strict
    }
}

impl Mode {
    /// True if a group left in this mode's end state also satisfies `wanted`.
    ///
    /// A strict sync leaves a subset of what an additive one would, so strict covers both.
    pub fn covers(self, wanted: Mode) -> bool {
        match (self, wanted) {
            (Mode::Strict, _) => true,
            (Mode::Additive, Mode::Additive) => true,
            (Mode::Additive, Mode::Strict) => false,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Mode::Strict => write!(f, "strict"),
            Mode::Additive => write!(f, "additive"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Mode::Strict),
            "additive" => Ok(Mode::Additive),
            m => Err(format!("unknown mode {} (expected strict or additive)", m)),
        }
    }
}

/// Whether `id` can name a security group.
///
/// Group ids end up in file names, so anything beyond `[A-Za-z0-9_-]` is refused.
pub fn valid_group_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Which security group ingress to keep pointed at the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub group_id: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Target {
    /// SSH (tcp/22) on the given group.
    pub fn ssh(group_id: impl Into<String>) -> Self {
        Target {
            group_id: group_id.into(),
            port: 22,
            protocol: Protocol::Tcp,
        }
    }

    pub fn port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        Self { protocol, ..self }
    }

    /// Refuse group ids that are not plain identifiers.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if valid_group_id(&self.group_id) {
            Ok(())
        } else {
            Err(crate::Error::InvalidGroupId(self.group_id.clone()))
        }
    }

    /// The rule that admits exactly `ip` on this target.
    pub fn desired_rule(&self, ip: Ipv4Addr) -> IngressRule {
        IngressRule::new(self.protocol, self.port, crate::ip::host_cidr(ip))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.group_id, self.protocol, self.port)
    }
}
