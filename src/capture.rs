//! Packet sources: live datalink capture and stored capture files.

use std::fs::File;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use memmap2::Mmap;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use pnet::datalink::{self, Channel::Ethernet, NetworkInterface};

use crate::error::{DetectorError, Result};
use crate::features::LinkType;

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// One frame as captured, tagged with its position in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    pub index: usize,
    pub link: LinkType,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum SourceEvent {
    Packet(CapturedPacket),
    /// Nothing arrived within the poll interval.
    Idle,
    ReadError(String),
    Closed,
}

pub trait PacketSource {
    /// Wait at most one poll interval for the next frame.
    fn next_event(&mut self) -> SourceEvent;
}

impl From<DataLink> for LinkType {
    fn from(link: DataLink) -> Self {
        match link {
            DataLink::ETHERNET => LinkType::Ethernet,
            DataLink::RAW | DataLink::IPV4 => LinkType::RawIp,
            DataLink::LINUX_SLL => LinkType::LinuxSll,
            DataLink::NULL => LinkType::Null,
            other => LinkType::Unsupported(u32::from(other)),
        }
    }
}

pub type FrameResult = std::result::Result<Vec<u8>, String>;

/// Frames delivered over a bounded channel by some producer thread.
pub struct ChannelSource {
    frames: Receiver<FrameResult>,
    link: LinkType,
    poll: Duration,
    next_index: usize,
}

impl ChannelSource {
    pub fn new(link: LinkType, poll: Duration, capacity: usize) -> (Sender<FrameResult>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let source = ChannelSource {
            frames: rx,
            link,
            poll,
            next_index: 0,
        };
        (tx, source)
    }
}

impl PacketSource for ChannelSource {
    fn next_event(&mut self) -> SourceEvent {
        match self.frames.recv_timeout(self.poll) {
            Ok(Ok(data)) => {
                let index = self.next_index;
                self.next_index += 1;
                SourceEvent::Packet(CapturedPacket {
                    index,
                    link: self.link,
                    data,
                })
            }
            Ok(Err(msg)) => SourceEvent::ReadError(msg),
            Err(RecvTimeoutError::Timeout) => SourceEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => SourceEvent::Closed,
        }
    }
}

/// Live capture on a network interface. The blocking datalink receiver runs
/// on its own thread and feeds a [`ChannelSource`].
pub struct LiveCapture {
    source: ChannelSource,
    closed: Arc<AtomicBool>,
    interface: String,
}

impl LiveCapture {
    pub fn open(interface: &NetworkInterface, poll: Duration, capacity: usize) -> Result<Self> {
        let config = datalink::Config {
            read_timeout: Some(poll),
            promiscuous: true,
            ..Default::default()
        };

        let mut rx = match datalink::channel(interface, config) {
            Ok(Ethernet(_, rx)) => rx,
            Ok(_) => {
                return Err(DetectorError::Capture(format!(
                    "unsupported channel type on {}",
                    interface.name
                )))
            }
            Err(e) => {
                return Err(DetectorError::Capture(format!(
                    "failed to open channel on {}: {}",
                    interface.name, e
                )))
            }
        };

        // Point-to-point links (tun devices) deliver bare IP packets
        let link = if interface.is_point_to_point() {
            LinkType::RawIp
        } else {
            LinkType::Ethernet
        };

        let (tx, source) = ChannelSource::new(link, poll, capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let worker_closed = closed.clone();

        thread::Builder::new()
            .name(format!("vajra-capture-{}", interface.name))
            .spawn(move || {
                let mut backoff = ErrorBackoff::new(poll);
                while !worker_closed.load(Ordering::SeqCst) {
                    let frame = match rx.next() {
                        Ok(packet) => {
                            backoff.reset();
                            Ok(packet.to_vec())
                        }
                        Err(e) if is_timeout(&e) => continue,
                        Err(e) => Err(e.to_string()),
                    };
                    let failed = frame.is_err();
                    if tx.send(frame).is_err() {
                        break;
                    }
                    if failed {
                        match backoff.next_delay() {
                            Some(delay) => thread::sleep(delay),
                            None => {
                                warn!("Giving up after {} consecutive capture errors", MAX_CONSECUTIVE_ERRORS);
                                break;
                            }
                        }
                    }
                }
                debug!("Capture thread exiting");
            })?;

        info!("Capturing on {} ({:?} frames)", interface.name, link);
        Ok(LiveCapture {
            source,
            closed,
            interface: interface.name.clone(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl PacketSource for LiveCapture {
    fn next_event(&mut self) -> SourceEvent {
        self.source.next_event()
    }
}

impl Drop for LiveCapture {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Delay between consecutive capture errors, doubling up to `max`. `None`
/// once the error budget is spent.
struct ErrorBackoff {
    base: Duration,
    max: Duration,
    consecutive: u32,
}

impl ErrorBackoff {
    fn new(max: Duration) -> Self {
        ErrorBackoff {
            base: Duration::from_millis(5),
            max: max.max(Duration::from_millis(5)),
            consecutive: 0,
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_ERRORS {
            return None;
        }
        let factor = 1u32 << (self.consecutive - 1).min(16);
        Some((self.base * factor).min(self.max))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn ipv4_addresses(iface: &NetworkInterface) -> Vec<String> {
    iface
        .ips
        .iter()
        .filter_map(|ip_network| {
            if let IpAddr::V4(ipv4) = ip_network.ip() {
                Some(ipv4.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Human-readable listing of the capture interfaces.
pub fn describe_interfaces() -> Vec<String> {
    datalink::interfaces()
        .iter()
        .enumerate()
        .map(|(i, iface)| {
            let ips = ipv4_addresses(iface);
            let ips = if ips.is_empty() {
                "No IPv4 assigned".to_string()
            } else {
                ips.join(", ")
            };
            let state = if iface.is_up() { "up" } else { "down" };
            format!("[{}] {} ({}) - IPs: {}", i, iface.name, state, ips)
        })
        .collect()
}

/// Interface by name, or the first one that is up, not loopback and has an
/// IPv4 address.
pub fn select_interface(name: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = datalink::interfaces();
    let found = match name {
        Some(name) => interfaces.into_iter().find(|i| i.name == name),
        None => interfaces
            .into_iter()
            .find(|i| i.is_up() && !i.is_loopback() && !ipv4_addresses(i).is_empty()),
    };
    found.ok_or_else(|| match name {
        Some(name) => DetectorError::UserInput(format!("no such interface '{}'", name)),
        None => DetectorError::Capture("no usable capture interface found".to_string()),
    })
}

/// Read a stored capture (pcap or pcapng) completely, in file order.
pub fn load_capture(path: &Path) -> Result<Vec<CapturedPacket>> {
    let file = File::open(path)
        .map_err(|e| DetectorError::CaptureRead(format!("cannot open {}: {}", path.display(), e)))?;
    // SAFETY: the mapping is read-only and dropped before this function returns
    let mmap = unsafe { Mmap::map(&file) }
        .map_err(|e| DetectorError::CaptureRead(format!("cannot map {}: {}", path.display(), e)))?;
    let bytes: &[u8] = &mmap;

    if bytes.len() < 4 {
        return Err(DetectorError::CaptureRead(format!(
            "{} is too short to be a capture file",
            path.display()
        )));
    }

    let packets = if bytes[..4] == PCAPNG_MAGIC {
        read_pcapng(bytes)?
    } else {
        read_pcap(bytes)?
    };
    debug!("Loaded {} packets from {}", packets.len(), path.display());
    Ok(packets)
}

fn read_pcap(bytes: &[u8]) -> Result<Vec<CapturedPacket>> {
    let mut reader = PcapReader::new(bytes)?;
    let link = LinkType::from(reader.header().datalink);
    if let LinkType::Unsupported(code) = link {
        warn!("Capture uses unsupported link type {}; every packet will be skipped", code);
    }

    let mut packets = Vec::new();
    while let Some(packet) = reader.next_packet() {
        let packet = packet?;
        packets.push(CapturedPacket {
            index: packets.len(),
            link,
            data: packet.data.to_vec(),
        });
    }
    Ok(packets)
}

fn read_pcapng(bytes: &[u8]) -> Result<Vec<CapturedPacket>> {
    let mut reader = PcapNgReader::new(bytes)?;
    let mut interfaces: Vec<LinkType> = Vec::new();
    let mut packets = Vec::new();

    while let Some(block) = reader.next_block() {
        let (interface_id, data) = match block? {
            Block::SectionHeader(_) => {
                interfaces.clear();
                continue;
            }
            Block::InterfaceDescription(idb) => {
                interfaces.push(LinkType::from(idb.linktype));
                continue;
            }
            Block::EnhancedPacket(epb) => (epb.interface_id as usize, epb.data.to_vec()),
            Block::SimplePacket(spb) => (0, spb.data.to_vec()),
            _ => continue,
        };

        let link = interfaces.get(interface_id).copied().ok_or_else(|| {
            DetectorError::CaptureRead(format!(
                "packet {} references undeclared interface {}",
                packets.len(),
                interface_id
            ))
        })?;
        packets.push(CapturedPacket {
            index: packets.len(),
            link,
            data,
        });
    }
    Ok(packets)
}
