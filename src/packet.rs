//! Raw Ethernet frames and the correlation rules used to match replies.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Local};
use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};

use crate::error::{Error, Result};
use crate::net::MacAddress;

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_ARP: u16 = 0x0806;
const ARP_LEN: usize = 28;
const ARP_REQUEST: u16 = 1;
const ARP_REPLY: u16 = 2;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Token grouping a request with its candidate replies.
pub type Fingerprint = Vec<u8>;

/// One captured or crafted frame, stamped with the time it was seen.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaPacket {
    data: Vec<u8>,
    time: DateTime<Local>,
}

#[derive(Debug, PartialEq)]
struct Arp {
    op: u16,
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
}

#[derive(Debug, PartialEq)]
enum L4 {
    Tcp { sport: u16, dport: u16 },
    Udp { sport: u16, dport: u16 },
    Echo { request: bool, id: u16, seq: u16, v6: bool },
    Other(u8),
}

#[derive(Debug, PartialEq)]
enum Layers {
    Arp(Arp),
    Ip { src: IpAddr, dst: IpAddr, l4: L4 },
    Link,
    Unknown,
}

impl MetaPacket {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_time(data, Local::now())
    }

    pub fn with_time(data: Vec<u8>, time: DateTime<Local>) -> Self {
        Self { data, time }
    }

    /// Parse a frame given as hex, ignoring whitespace and `:` separators.
    pub fn from_hex(text: &str) -> Result<Self> {
        let digits: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':')
            .collect();
        let data = hex::decode(digits).map_err(|e| Error::packet(e.to_string()))?;
        if data.len() < ETH_HEADER_LEN {
            return Err(Error::packet(format!(
                "frame is {} bytes, shorter than an Ethernet header",
                data.len()
            )));
        }
        Ok(Self::new(data))
    }

    /// Build an ICMPv4 echo request.
    pub fn icmp_echo(
        source_mac: MacAddress,
        destination_mac: MacAddress,
        source_ip: Ipv4Addr,
        destination_ip: Ipv4Addr,
        id: u16,
        seq: u16,
    ) -> Result<Self> {
        let builder = PacketBuilder::ethernet2(source_mac.octets(), destination_mac.octets())
            .ipv4(source_ip.octets(), destination_ip.octets(), 64)
            .icmpv4_echo_request(id, seq);
        let payload = [0u8; 32];
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder
            .write(&mut data, &payload)
            .map_err(|e| Error::packet(e.to_string()))?;
        Ok(Self::new(data))
    }

    pub fn encode(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.time
    }

    /// Symmetric in the address and port pairs, so a reply hashes like the
    /// request it answers.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut token = Vec::new();
        match self.layers() {
            Layers::Arp(arp) => {
                token.extend_from_slice(&ETHERTYPE_ARP.to_be_bytes());
                token.extend(xor(&arp.sender_ip.octets(), &arp.target_ip.octets()));
            }
            Layers::Ip { src, dst, l4 } => {
                match (src, dst) {
                    (IpAddr::V4(s), IpAddr::V4(d)) => {
                        token.push(4);
                        token.extend(xor(&s.octets(), &d.octets()));
                    }
                    (IpAddr::V6(s), IpAddr::V6(d)) => {
                        token.push(6);
                        token.extend(xor(&s.octets(), &d.octets()));
                    }
                    _ => {}
                }
                match l4 {
                    L4::Tcp { sport, dport } => {
                        token.push(6);
                        token.extend_from_slice(&(sport ^ dport).to_be_bytes());
                    }
                    L4::Udp { sport, dport } => {
                        token.push(17);
                        token.extend_from_slice(&(sport ^ dport).to_be_bytes());
                    }
                    L4::Echo { id, seq, v6, .. } => {
                        token.push(if v6 { 58 } else { 1 });
                        token.extend_from_slice(&id.to_be_bytes());
                        token.extend_from_slice(&seq.to_be_bytes());
                    }
                    L4::Other(proto) => token.push(proto),
                }
            }
            Layers::Link | Layers::Unknown => {}
        }
        token
    }

    /// Whether this frame is a reply to `request`.
    pub fn is_answer_to(&self, request: &MetaPacket) -> bool {
        match (self.layers(), request.layers()) {
            (Layers::Arp(reply), Layers::Arp(req)) => {
                req.op == ARP_REQUEST
                    && reply.op == ARP_REPLY
                    && reply.sender_ip == req.target_ip
                    && reply.target_ip == req.sender_ip
            }
            (
                Layers::Ip { src, dst, l4 },
                Layers::Ip {
                    src: req_src,
                    dst: req_dst,
                    l4: req_l4,
                },
            ) => {
                if src != req_dst || dst != req_src {
                    return false;
                }
                match (l4, req_l4) {
                    (L4::Tcp { sport, dport }, L4::Tcp { sport: rs, dport: rd })
                    | (L4::Udp { sport, dport }, L4::Udp { sport: rs, dport: rd }) => {
                        sport == rd && dport == rs
                    }
                    (
                        L4::Echo {
                            request: false,
                            id,
                            seq,
                            v6,
                        },
                        L4::Echo {
                            request: true,
                            id: rid,
                            seq: rseq,
                            v6: rv6,
                        },
                    ) => id == rid && seq == rseq && v6 == rv6,
                    (L4::Other(proto), L4::Other(req_proto)) => proto == req_proto,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// The IPv4 to MAC binding this frame asserts about its destination.
    pub fn learned_mapping(&self) -> Option<(Ipv4Addr, MacAddress)> {
        let mapping = match self.layers() {
            Layers::Arp(arp) if arp.op == ARP_REPLY => {
                Some((arp.target_ip, MacAddress::new(arp.target_mac)))
            }
            Layers::Ip {
                dst: IpAddr::V4(dst),
                ..
            } => Some((dst, self.link_destination()?)),
            _ => None,
        };
        mapping.filter(|(_, mac)| mac.is_unicast())
    }

    pub fn source(&self) -> String {
        match self.layers() {
            Layers::Arp(arp) => arp.sender_ip.to_string(),
            Layers::Ip { src, .. } => src.to_string(),
            _ => self
                .link_source()
                .map_or_else(|| String::from("N/A"), |mac| mac.to_string()),
        }
    }

    pub fn destination(&self) -> String {
        match self.layers() {
            Layers::Arp(arp) => arp.target_ip.to_string(),
            Layers::Ip { dst, .. } => dst.to_string(),
            _ => self
                .link_destination()
                .map_or_else(|| String::from("N/A"), |mac| mac.to_string()),
        }
    }

    /// Name of the innermost recognised protocol.
    pub fn protocol(&self) -> String {
        let name = match self.layers() {
            Layers::Arp(_) => "ARP",
            Layers::Ip { l4, src, .. } => match l4 {
                L4::Tcp { .. } => "TCP",
                L4::Udp { .. } => "UDP",
                L4::Echo { v6: false, .. } => "ICMP",
                L4::Echo { v6: true, .. } => "ICMPv6",
                L4::Other(_) if src.is_ipv4() => "IPv4",
                L4::Other(_) => "IPv6",
            },
            Layers::Link => "Ethernet",
            Layers::Unknown => "N/A",
        };
        name.to_owned()
    }

    pub fn summary(&self) -> String {
        let mut line = format!("{} {} > {}", self.protocol(), self.source(), self.destination());
        match self.layers() {
            Layers::Arp(arp) if arp.op == ARP_REQUEST => line.push_str(" who-has"),
            Layers::Arp(arp) if arp.op == ARP_REPLY => {
                line.push_str(&format!(" is-at {}", MacAddress::new(arp.sender_mac)))
            }
            Layers::Ip {
                l4: L4::Tcp { sport, dport },
                ..
            }
            | Layers::Ip {
                l4: L4::Udp { sport, dport },
                ..
            } => line.push_str(&format!(" {} > {}", sport, dport)),
            Layers::Ip {
                l4: L4::Echo { request, id, seq, .. },
                ..
            } => line.push_str(&format!(
                " echo-{} id={} seq={}",
                if request { "request" } else { "reply" },
                id,
                seq
            )),
            _ => {}
        }
        line
    }

    fn link_source(&self) -> Option<MacAddress> {
        self.data
            .get(6..12)
            .and_then(|b| b.try_into().ok())
            .map(MacAddress::new)
    }

    fn link_destination(&self) -> Option<MacAddress> {
        self.data
            .get(0..6)
            .and_then(|b| b.try_into().ok())
            .map(MacAddress::new)
    }

    fn layers(&self) -> Layers {
        if self.data.len() < ETH_HEADER_LEN {
            return Layers::Unknown;
        }
        if u16::from_be_bytes([self.data[12], self.data[13]]) == ETHERTYPE_ARP {
            return parse_arp(&self.data[ETH_HEADER_LEN..]).map_or(Layers::Link, Layers::Arp);
        }

        let Ok(sliced) = SlicedPacket::from_ethernet(&self.data) else {
            return Layers::Link;
        };
        let (src, dst, proto) = match &sliced.net {
            Some(NetSlice::Ipv4(ip)) => {
                let header = ip.header();
                (
                    IpAddr::V4(header.source_addr()),
                    IpAddr::V4(header.destination_addr()),
                    header.protocol().0,
                )
            }
            Some(NetSlice::Ipv6(ip)) => {
                let header = ip.header();
                (
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                    header.next_header().0,
                )
            }
            _ => return Layers::Link,
        };

        let l4 = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => L4::Tcp {
                sport: tcp.source_port(),
                dport: tcp.destination_port(),
            },
            Some(TransportSlice::Udp(udp)) => L4::Udp {
                sport: udp.source_port(),
                dport: udp.destination_port(),
            },
            Some(TransportSlice::Icmpv4(icmp)) => echo(icmp.slice(), false).unwrap_or(L4::Other(proto)),
            Some(TransportSlice::Icmpv6(icmp)) => echo(icmp.slice(), true).unwrap_or(L4::Other(proto)),
            _ => L4::Other(proto),
        };
        Layers::Ip { src, dst, l4 }
    }
}

fn parse_arp(body: &[u8]) -> Option<Arp> {
    if body.len() < ARP_LEN {
        return None;
    }
    // Only Ethernet/IPv4 bindings
    if body[4] != 6 || body[5] != 4 {
        return None;
    }
    Some(Arp {
        op: u16::from_be_bytes([body[6], body[7]]),
        sender_mac: body[8..14].try_into().ok()?,
        sender_ip: Ipv4Addr::new(body[14], body[15], body[16], body[17]),
        target_mac: body[18..24].try_into().ok()?,
        target_ip: Ipv4Addr::new(body[24], body[25], body[26], body[27]),
    })
}

fn echo(icmp: &[u8], v6: bool) -> Option<L4> {
    if icmp.len() < 8 {
        return None;
    }
    let (req_type, reply_type) = if v6 {
        (ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY)
    } else {
        (ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY)
    };
    let request = match icmp[0] {
        t if t == req_type => true,
        t if t == reply_type => false,
        _ => return None,
    };
    Some(L4::Echo {
        request,
        id: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
        v6,
    })
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}
