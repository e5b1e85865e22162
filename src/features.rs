//! Per-packet feature extraction.
//!
//! A captured frame is decoded down to its IPv4 header (and TCP header when
//! present) and mapped onto the named fields the training datasets use.
//! Frames without an IPv4 layer are not errors: they come back as
//! [`Extraction::Skip`] and the caller counts them.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::vlan::VlanPacket;

pub mod names {
    pub const FRAME_LEN: &str = "frame.len";
    pub const IP_PROTO: &str = "ip.proto";
    pub const TCP_SRCPORT: &str = "tcp.srcport";
    pub const TCP_DSTPORT: &str = "tcp.dstport";
    pub const TCP_FLAGS: &str = "tcp.flags";
    pub const TCP_FLAGS_SYN: &str = "tcp.flags.syn";
    pub const TCP_FLAGS_ACK: &str = "tcp.flags.ack";
    pub const TCP_FLAGS_PUSH: &str = "tcp.flags.push";

    /// Every field the extractor emits, in the order the trained model's
    /// feature list sorts them.
    pub const PACKET_FEATURES: [&str; 8] = [
        FRAME_LEN,
        IP_PROTO,
        TCP_DSTPORT,
        TCP_FLAGS,
        TCP_FLAGS_ACK,
        TCP_FLAGS_PUSH,
        TCP_FLAGS_SYN,
        TCP_SRCPORT,
    ];
}

// TCP flag bits
const SYN: u8 = 0x02;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

const ETHERTYPE_QINQ: u16 = 0x88a8;
const ETHERTYPE_VLAN_LEGACY: u16 = 0x9100;
const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const AF_INET: u32 = 2;

/// A single value in a raw feature map. Dataset cells arrive as text, packet
/// fields as integers; the reconciler coerces all of them.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl FeatureValue {
    /// Numeric view of the value. `None` for anything that is not a finite
    /// number.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            FeatureValue::Int(v) => *v as f64,
            FeatureValue::Float(v) => *v,
            FeatureValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            FeatureValue::Text(s) => s.trim().parse::<f64>().ok()?,
            FeatureValue::Null => return None,
        };
        if value.is_finite() {
            Some(value)
        } else {
            None
        }
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Int(v)
    }
}

impl From<u16> for FeatureValue {
    fn from(v: u16) -> Self {
        FeatureValue::Int(v as i64)
    }
}

impl From<u8> for FeatureValue {
    fn from(v: u8) -> Self {
        FeatureValue::Int(v as i64)
    }
}

impl From<usize> for FeatureValue {
    fn from(v: usize) -> Self {
        FeatureValue::Int(v as i64)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float(v)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        if v.trim().is_empty() {
            FeatureValue::Null
        } else {
            FeatureValue::Text(v.to_string())
        }
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::from(v.as_str())
    }
}

/// Named feature values for one packet or one dataset row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFeatureMap {
    values: HashMap<String, FeatureValue>,
}

impl RawFeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map built from a vector that is already in canonical order.
    pub fn from_vector(names: &[String], values: &[f64]) -> Self {
        let mut map = Self::new();
        for (name, value) in names.iter().zip(values.iter()) {
            map.insert(name.clone(), *value);
        }
        map
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FeatureValue> {
        self.values.remove(name)
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(value) = self.values.remove(from) {
            self.values.insert(to.to_string(), value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

/// Link-layer framing of a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
    LinuxSll,
    Null,
    Unsupported(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedLink,
    NoIpLayer,
    Malformed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedLink => write!(f, "unsupported link type"),
            SkipReason::NoIpLayer => write!(f, "no IPv4 layer"),
            SkipReason::Malformed => write!(f, "malformed IPv4 header"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketFeatures {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub raw: RawFeatureMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Features(PacketFeatures),
    Skip(SkipReason),
}

impl Extraction {
    pub fn is_skip(&self) -> bool {
        matches!(self, Extraction::Skip(_))
    }
}

/// Decode one captured frame into its raw feature map.
pub fn extract_features(frame: &[u8], link: LinkType) -> Extraction {
    let ip = match network_layer(frame, link) {
        Ok(ip) => ip,
        Err(reason) => return Extraction::Skip(reason),
    };

    let ipv4 = match Ipv4Packet::new(ip) {
        Some(p) if p.get_version() == 4 => p,
        _ => return Extraction::Skip(SkipReason::NoIpLayer),
    };

    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < 20 || header_len > ip.len() {
        return Extraction::Skip(SkipReason::Malformed);
    }

    // Offloaded captures report a zero total length; fall back to what we have
    let total_len = match ipv4.get_total_length() as usize {
        0 => ip.len(),
        n => n.min(ip.len()),
    };
    if total_len < header_len {
        return Extraction::Skip(SkipReason::Malformed);
    }

    let protocol = ipv4.get_next_level_protocol();
    let mut raw = RawFeatureMap::new();
    raw.insert(names::FRAME_LEN, frame.len());
    raw.insert(names::IP_PROTO, protocol.0);

    let mut tcp_fields = TcpFields::default();
    // Only the first fragment carries the transport header
    if protocol == IpNextHeaderProtocols::Tcp && ipv4.get_fragment_offset() == 0 {
        if let Some(tcp) = TcpPacket::new(&ip[header_len..total_len]) {
            tcp_fields = TcpFields::from_packet(&tcp);
        }
    }
    tcp_fields.write_into(&mut raw);

    Extraction::Features(PacketFeatures {
        source: ipv4.get_source(),
        destination: ipv4.get_destination(),
        raw,
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct TcpFields {
    src_port: u16,
    dst_port: u16,
    flags: u8,
}

impl TcpFields {
    fn from_packet(tcp: &TcpPacket) -> Self {
        TcpFields {
            src_port: tcp.get_source(),
            dst_port: tcp.get_destination(),
            flags: tcp.get_flags(),
        }
    }

    fn write_into(&self, raw: &mut RawFeatureMap) {
        raw.insert(names::TCP_SRCPORT, self.src_port);
        raw.insert(names::TCP_DSTPORT, self.dst_port);
        raw.insert(names::TCP_FLAGS, self.flags);
        raw.insert(names::TCP_FLAGS_SYN, flag_bit(self.flags, SYN));
        raw.insert(names::TCP_FLAGS_ACK, flag_bit(self.flags, ACK));
        raw.insert(names::TCP_FLAGS_PUSH, flag_bit(self.flags, PSH));
    }
}

fn flag_bit(flags: u8, mask: u8) -> u8 {
    if flags & mask != 0 {
        1
    } else {
        0
    }
}

/// Strip the link-layer header and return the bytes of the IPv4 packet.
fn network_layer(frame: &[u8], link: LinkType) -> std::result::Result<&[u8], SkipReason> {
    match link {
        LinkType::Ethernet => {
            let ethernet = EthernetPacket::new(frame).ok_or(SkipReason::Malformed)?;
            let mut ethertype = ethernet.get_ethertype();
            let mut offset = EthernetPacket::minimum_packet_size();

            while ethertype == EtherTypes::Vlan
                || ethertype.0 == ETHERTYPE_QINQ
                || ethertype.0 == ETHERTYPE_VLAN_LEGACY
            {
                let vlan = VlanPacket::new(&frame[offset..]).ok_or(SkipReason::Malformed)?;
                ethertype = vlan.get_ethertype();
                offset += VlanPacket::minimum_packet_size();
            }

            if ethertype != EtherTypes::Ipv4 {
                return Err(SkipReason::NoIpLayer);
            }
            Ok(&frame[offset..])
        }
        LinkType::RawIp => Ok(frame),
        LinkType::LinuxSll => {
            if frame.len() < SLL_HEADER_LEN {
                return Err(SkipReason::Malformed);
            }
            let protocol = u16::from_be_bytes([frame[14], frame[15]]);
            if protocol != EtherTypes::Ipv4.0 {
                return Err(SkipReason::NoIpLayer);
            }
            Ok(&frame[SLL_HEADER_LEN..])
        }
        LinkType::Null => {
            if frame.len() < NULL_HEADER_LEN {
                return Err(SkipReason::Malformed);
            }
            let family = [frame[0], frame[1], frame[2], frame[3]];
            // Written in the capturing host's byte order
            if u32::from_le_bytes(family) != AF_INET && u32::from_be_bytes(family) != AF_INET {
                return Err(SkipReason::NoIpLayer);
            }
            Ok(&frame[NULL_HEADER_LEN..])
        }
        LinkType::Unsupported(_) => Err(SkipReason::UnsupportedLink),
    }
}
