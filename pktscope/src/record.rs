use etherparse::{IpNumber, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::fmt;
use std::net::Ipv4Addr;

use pktscope_common::{STAGE_POST_ROUTING, STAGE_PRE_ROUTING};

/// Interception point a packet was observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before the routing decision (TC ingress).
    PreRouting,
    /// After the routing decision (TC egress).
    PostRouting,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::PreRouting, Stage::PostRouting];

    pub fn label(self) -> &'static str {
        match self {
            Stage::PreRouting => "PRE_ROUTING",
            Stage::PostRouting => "POST_ROUTING",
        }
    }

    /// Decode the tag written by the TC classifiers.
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            STAGE_PRE_ROUTING => Some(Stage::PreRouting),
            STAGE_POST_ROUTING => Some(Stage::PostRouting),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Stage::PreRouting => 0,
            Stage::PostRouting => 1,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Transport-layer summary of one observed packet.
///
/// Lives only for the duration of a single dispatch: it is rendered to a
/// [`LogLine`](crate::format::LogLine) and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    pub stage: Stage,
    pub protocol: Protocol,
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

/// Extract TCP/UDP endpoints from a buffer starting at the IPv4 header.
///
/// Returns `None` for anything that is not a well-formed IPv4 header followed
/// by a complete TCP or UDP header inside `raw`. All reads are bounded by the
/// slice; header-declared lengths are only trusted after they have been
/// checked against it. Non-first fragments carry no transport header and are
/// skipped as well.
///
/// `raw` may be a captured prefix of the packet, or may run past its end into
/// link-layer padding. The transport header must lie within both `raw` and
/// the IPv4 total length.
pub fn parse(stage: Stage, raw: &[u8]) -> Option<PacketRecord> {
    let ip = Ipv4HeaderSlice::from_slice(raw).ok()?;
    if ip.fragments_offset().value() != 0 {
        return None;
    }

    let end = usize::from(ip.total_len()).min(raw.len());
    let transport = raw.get(ip.slice().len()..end)?;
    let (protocol, src_port, dst_port) = match ip.protocol() {
        IpNumber::TCP => {
            let tcp = TcpHeaderSlice::from_slice(transport).ok()?;
            (Protocol::Tcp, tcp.source_port(), tcp.destination_port())
        }
        IpNumber::UDP => {
            let udp = UdpHeaderSlice::from_slice(transport).ok()?;
            (Protocol::Udp, udp.source_port(), udp.destination_port())
        }
        _ => return None,
    };

    Some(PacketRecord {
        stage,
        protocol,
        src_addr: ip.source_addr(),
        src_port,
        dst_addr: ip.destination_addr(),
        dst_port,
    })
}
