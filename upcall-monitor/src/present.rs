//! Human-readable rendering of upcalls: table rows, flow key dumps, packet
//! dumps and dissection, plus the hand-off to the pcap writer.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};

use clap::ValueEnum;
use log::debug;
use pnet_packet::Packet;
use pnet_packet::arp::ArpPacket;
use pnet_packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet_packet::icmp::IcmpPacket;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::vlan::VlanPacket;
use serde::Deserialize;

use crate::pcap::PcapWriter;
use crate::record::UpcallEvent;
use crate::tlv::{self, Decoded};

/// How packet contents are shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketDecode {
    #[default]
    None,
    Hex,
    Decode,
}

/// How flow keys are shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDecode {
    #[default]
    None,
    Hex,
    Nlraw,
}

const KEY_INDENT: &str = "    ";

/// What presenting one event produced, for accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Presented {
    pub key_truncated: bool,
    /// Running id of the packet, if the event carried one.
    pub packet_id: Option<u64>,
    pub pcap_written: bool,
}

pub fn table_header() -> String {
    format!(
        "{:<18} {:<4} {:<16} {:<10} {:<32} {:<4} {:<10} {:<10}",
        "TIME", "CPU", "COMM", "PID", "DPIF_NAME", "TYPE", "PKT_LEN", "FLOW_KEY_LEN"
    )
}

pub fn table_row(ev: &UpcallEvent) -> String {
    let ts = format!(
        "{}.{:09}",
        ev.ts_ns / 1_000_000_000,
        ev.ts_ns % 1_000_000_000
    );
    format!(
        "{:<18} {:<4} {:<16} {:<10} {:<32} {:<4} {:<10} {:<10}",
        ts, ev.cpu, ev.comm, ev.pid, ev.dpif_name, ev.upcall_type, ev.pkt_size, ev.key_size
    )
}

/// Offset, upper-case hex and ASCII columns, 16 bytes per line.
pub fn hexdump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let mut hex = String::with_capacity(48);
            for b in chunk {
                let _ = write!(hex, "{b:02X} ");
            }
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
                .collect();
            format!("{:04x}  {hex:<48} {ascii}", i * 16)
        })
        .collect()
}

/// One line per attribute, with the truncation warning last.
pub fn nlraw_lines(decoded: &Decoded<'_>) -> Vec<String> {
    let mut lines: Vec<String> = decoded
        .attributes
        .iter()
        .map(|a| {
            let mut data = String::with_capacity(a.value.len() * 3);
            for b in a.value {
                let _ = write!(data, "{b:02x} ");
            }
            format!(
                "nla_len {}, nla_type {}[{}], data: {}{}",
                a.declared_len,
                a.name(),
                a.kind,
                data,
                if a.truncated { "..." } else { "" }
            )
        })
        .collect();
    lines.extend(decoded.diagnostics.iter().map(|d| format!("WARN: {d}")));
    lines
}

struct Dissector {
    lines: Vec<String>,
    depth: usize,
}

impl Dissector {
    fn layer(&mut self, name: &str, fields: &[(&str, String)]) {
        let pad = "  ".repeat(self.depth);
        self.lines.push(format!("{pad}###[ {name} ]###"));
        for (key, value) in fields {
            self.lines.push(format!("{pad}  {key:<9} = {value}"));
        }
        self.depth += 1;
    }

    fn raw(&mut self, payload: &[u8]) {
        if !payload.is_empty() {
            self.layer("Raw", &[("load", format!("{} bytes", payload.len()))]);
        }
    }
}

fn ether_name(ty: EtherType) -> String {
    match ty {
        EtherTypes::Ipv4 => "IPv4".into(),
        EtherTypes::Ipv6 => "IPv6".into(),
        EtherTypes::Arp => "ARP".into(),
        EtherTypes::Vlan => "802.1Q".into(),
        other => format!("{:#06x}", other.0),
    }
}

fn proto_name(proto: IpNextHeaderProtocol) -> String {
    match proto {
        IpNextHeaderProtocols::Tcp => "tcp".into(),
        IpNextHeaderProtocols::Udp => "udp".into(),
        IpNextHeaderProtocols::Icmp => "icmp".into(),
        IpNextHeaderProtocols::Icmpv6 => "ipv6-icmp".into(),
        other => other.0.to_string(),
    }
}

fn icmp_type_name(ty: u8) -> String {
    match ty {
        0 => "echo-reply".into(),
        3 => "dest-unreach".into(),
        5 => "redirect".into(),
        8 => "echo-request".into(),
        11 => "time-exceeded".into(),
        other => other.to_string(),
    }
}

/// Layer-by-layer summary of an Ethernet frame. Unparseable remainders are
/// shown as raw bytes.
pub fn dissect(frame: &[u8]) -> Vec<String> {
    let mut d = Dissector {
        lines: Vec::new(),
        depth: 0,
    };
    let Some(eth) = EthernetPacket::new(frame) else {
        d.raw(frame);
        return d.lines;
    };
    d.layer(
        "Ethernet",
        &[
            ("dst", eth.get_destination().to_string()),
            ("src", eth.get_source().to_string()),
            ("type", ether_name(eth.get_ethertype())),
        ],
    );
    dissect_ethertype(&mut d, eth.get_ethertype(), eth.payload());
    d.lines
}

fn dissect_ethertype(d: &mut Dissector, ty: EtherType, payload: &[u8]) {
    match ty {
        EtherTypes::Vlan => match VlanPacket::new(payload) {
            Some(vlan) => {
                d.layer(
                    "802.1Q",
                    &[
                        ("prio", vlan.get_priority_code_point().0.to_string()),
                        ("id", vlan.get_drop_eligible_indicator().to_string()),
                        ("vlan", vlan.get_vlan_identifier().to_string()),
                        ("type", ether_name(vlan.get_ethertype())),
                    ],
                );
                dissect_ethertype(d, vlan.get_ethertype(), vlan.payload());
            }
            None => d.raw(payload),
        },
        EtherTypes::Arp => match ArpPacket::new(payload) {
            Some(arp) => d.layer(
                "ARP",
                &[
                    ("op", arp.get_operation().0.to_string()),
                    ("hwsrc", arp.get_sender_hw_addr().to_string()),
                    ("psrc", arp.get_sender_proto_addr().to_string()),
                    ("hwdst", arp.get_target_hw_addr().to_string()),
                    ("pdst", arp.get_target_proto_addr().to_string()),
                ],
            ),
            None => d.raw(payload),
        },
        EtherTypes::Ipv4 => match Ipv4Packet::new(payload) {
            Some(ip) if ip.get_header_length() >= 5 => {
                let flags = ip.get_flags();
                let flag_str = match (flags & 0b010 != 0, flags & 0b001 != 0) {
                    (true, true) => "DF+MF".to_string(),
                    (true, false) => "DF".to_string(),
                    (false, true) => "MF".to_string(),
                    (false, false) => String::new(),
                };
                d.layer(
                    "IP",
                    &[
                        ("version", ip.get_version().to_string()),
                        ("ihl", ip.get_header_length().to_string()),
                        (
                            "tos",
                            format!("{:#x}", (ip.get_dscp() << 2) | ip.get_ecn()),
                        ),
                        ("len", ip.get_total_length().to_string()),
                        ("id", ip.get_identification().to_string()),
                        ("flags", flag_str),
                        ("frag", ip.get_fragment_offset().to_string()),
                        ("ttl", ip.get_ttl().to_string()),
                        ("proto", proto_name(ip.get_next_level_protocol())),
                        ("chksum", format!("{:#x}", ip.get_checksum())),
                        ("src", ip.get_source().to_string()),
                        ("dst", ip.get_destination().to_string()),
                    ],
                );
                dissect_transport(d, ip.get_next_level_protocol(), ip.payload());
            }
            _ => d.raw(payload),
        },
        EtherTypes::Ipv6 => match Ipv6Packet::new(payload) {
            Some(ip) => {
                d.layer(
                    "IPv6",
                    &[
                        ("version", ip.get_version().to_string()),
                        ("tc", ip.get_traffic_class().to_string()),
                        ("fl", ip.get_flow_label().to_string()),
                        ("plen", ip.get_payload_length().to_string()),
                        ("nh", proto_name(ip.get_next_header())),
                        ("hlim", ip.get_hop_limit().to_string()),
                        ("src", ip.get_source().to_string()),
                        ("dst", ip.get_destination().to_string()),
                    ],
                );
                dissect_transport(d, ip.get_next_header(), ip.payload());
            }
            None => d.raw(payload),
        },
        _ => d.raw(payload),
    }
}

fn dissect_transport(d: &mut Dissector, proto: IpNextHeaderProtocol, payload: &[u8]) {
    match proto {
        IpNextHeaderProtocols::Tcp => match TcpPacket::new(payload) {
            Some(tcp) => {
                d.layer(
                    "TCP",
                    &[
                        ("sport", tcp.get_source().to_string()),
                        ("dport", tcp.get_destination().to_string()),
                        ("seq", tcp.get_sequence().to_string()),
                        ("ack", tcp.get_acknowledgement().to_string()),
                        ("dataofs", tcp.get_data_offset().to_string()),
                        ("flags", format!("{:#x}", tcp.get_flags())),
                        ("window", tcp.get_window().to_string()),
                        ("chksum", format!("{:#x}", tcp.get_checksum())),
                    ],
                );
                d.raw(tcp.payload());
            }
            None => d.raw(payload),
        },
        IpNextHeaderProtocols::Udp => match UdpPacket::new(payload) {
            Some(udp) => {
                d.layer(
                    "UDP",
                    &[
                        ("sport", udp.get_source().to_string()),
                        ("dport", udp.get_destination().to_string()),
                        ("len", udp.get_length().to_string()),
                        ("chksum", format!("{:#x}", udp.get_checksum())),
                    ],
                );
                d.raw(udp.payload());
            }
            None => d.raw(payload),
        },
        IpNextHeaderProtocols::Icmp => match IcmpPacket::new(payload) {
            Some(icmp) => {
                d.layer(
                    "ICMP",
                    &[
                        ("type", icmp_type_name(icmp.get_icmp_type().0)),
                        ("code", icmp.get_icmp_code().0.to_string()),
                        ("chksum", format!("{:#x}", icmp.get_checksum())),
                    ],
                );
                d.raw(icmp.payload());
            }
            None => d.raw(payload),
        },
        _ => d.raw(payload),
    }
}

/// Renders events to `out` and, when configured, forwards packets to a pcap
/// writer. Owns the running packet id.
pub struct Presenter<W: Write, P: Write = BufWriter<File>> {
    out: W,
    packet_decode: PacketDecode,
    key_decode: KeyDecode,
    pcap: Option<PcapWriter<P>>,
    packet_id: u64,
}

impl<W: Write, P: Write> Presenter<W, P> {
    pub fn new(out: W, packet_decode: PacketDecode, key_decode: KeyDecode) -> Self {
        Self {
            out,
            packet_decode,
            key_decode,
            pcap: None,
            packet_id: 0,
        }
    }

    pub fn with_pcap(mut self, pcap: PcapWriter<P>) -> Self {
        self.set_pcap(pcap);
        self
    }

    pub fn set_pcap(&mut self, pcap: PcapWriter<P>) {
        self.pcap = Some(pcap);
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", table_header())
    }

    /// The in-port is only printed next to a packet, so the key is parsed
    /// when it is shown raw or when a packet line will be printed.
    fn needs_key(&self, ev: &UpcallEvent) -> bool {
        self.key_decode == KeyDecode::Nlraw || (ev.pkt_size > 0 && self.shows_packet_line())
    }

    fn shows_packet_line(&self) -> bool {
        self.packet_decode != PacketDecode::None || self.pcap.is_some()
    }

    pub fn present(&mut self, ev: &UpcallEvent) -> io::Result<Presented> {
        let mut result = Presented::default();
        writeln!(self.out, "{}", table_row(ev))?;

        if self.key_decode != KeyDecode::None {
            writeln!(
                self.out,
                "  Flow key size {} bytes, size captured {} bytes.",
                ev.key_size,
                ev.key.len()
            )?;
        }
        if self.key_decode == KeyDecode::Hex {
            for line in hexdump(&ev.key) {
                writeln!(self.out, "{KEY_INDENT}{line}")?;
            }
        }

        let decoded = if self.needs_key(ev) {
            tlv::decode(&ev.key, ev.key.len())
        } else {
            Decoded::default()
        };
        result.key_truncated = decoded.is_truncated();
        for d in &decoded.diagnostics {
            debug!("flow key of pid {} at {}: {d}", ev.pid, ev.ts_ns);
        }
        if self.key_decode == KeyDecode::Nlraw {
            for line in nlraw_lines(&decoded) {
                writeln!(self.out, "{KEY_INDENT}{line}")?;
            }
        }

        if ev.pkt_size == 0 {
            return Ok(result);
        }
        self.packet_id += 1;
        result.packet_id = Some(self.packet_id);

        if self.shows_packet_line() {
            let port = decoded
                .in_port()
                .map_or_else(|| "Unknown".to_string(), |p| p.to_string());
            writeln!(
                self.out,
                "  {}: Receive dp_port {port}, packet size {} bytes, size captured {} bytes.",
                self.packet_id,
                ev.pkt_size,
                ev.packet.len()
            )?;
        }
        match self.packet_decode {
            PacketDecode::None => {}
            PacketDecode::Hex => {
                for line in hexdump(&ev.packet) {
                    writeln!(self.out, "    {line}")?;
                }
            }
            PacketDecode::Decode => {
                for line in dissect(&ev.packet) {
                    writeln!(self.out, "    {line}")?;
                }
            }
        }

        if let Some(pcap) = self.pcap.as_mut() {
            pcap.write_packet(ev.ts_ns, &ev.packet, ev.pkt_size)?;
            result.pcap_written = true;
        }
        Ok(result)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()?;
        if let Some(pcap) = self.pcap.as_mut() {
            pcap.flush()?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (W, Option<PcapWriter<P>>) {
        (self.out, self.pcap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::attr;

    // Ethernet / IPv4 / ICMP echo-request, 98 bytes on the wire.
    fn icmp_frame() -> Vec<u8> {
        let mut f = vec![
            0x3c, 0xfd, 0xfe, 0x9e, 0x7f, 0x68, 0x04, 0xf4, 0xbc, 0x28, 0x57, 0x01, 0x08, 0x00,
        ];
        f.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x54, 0xa1, 0xbc, 0x40, 0x00, 0x40, 0x01, 0x94, 0x0c, 1, 1, 1, 100,
            1, 1, 1, 123,
        ]);
        f.extend_from_slice(&[0x08, 0x00, 0x2f, 0x55, 0x90, 0xe6, 0x00, 0x01]);
        f.resize(98, 0x42);
        f
    }

    fn event(packet: Vec<u8>, key: Vec<u8>) -> UpcallEvent {
        UpcallEvent {
            ts_ns: 5_953_013_333_214_231,
            cpu: 2,
            pid: 1_381_158,
            comm: "handler4".into(),
            dpif_name: "system@ovs-system".into(),
            upcall_type: 0,
            pkt_size: 98,
            key_size: key.len() as u64,
            packet,
            key,
        }
    }

    fn key() -> Vec<u8> {
        tlv::encode([
            (attr::RECIRC_ID, &[0u8, 0, 0, 0][..]),
            (attr::IN_PORT, &2u32.to_ne_bytes()[..]),
            (attr::CT_ZONE, &[0u8, 0][..]),
        ])
    }

    fn render(p: PacketDecode, k: KeyDecode, ev: &UpcallEvent) -> String {
        let mut presenter: Presenter<Vec<u8>, Vec<u8>> = Presenter::new(Vec::new(), p, k);
        presenter.present(ev).unwrap();
        let (out, _) = presenter.into_parts();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn row_matches_column_layout() {
        let ev = event(icmp_frame()[..64].to_vec(), key());
        let row = table_row(&ev);
        assert!(row.starts_with("5953013.333214231  2    handler4         1381158    system@ovs-system"));
        assert_eq!(table_header().split_whitespace().count(), 8);
    }

    #[test]
    fn nlraw_shows_every_attribute() {
        let ev = event(icmp_frame()[..64].to_vec(), key());
        let out = render(PacketDecode::None, KeyDecode::Nlraw, &ev);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "  Flow key size 24 bytes, size captured 24 bytes.");
        assert_eq!(
            lines[2],
            "    nla_len 8, nla_type OVS_KEY_ATTR_RECIRC_ID[20], data: 00 00 00 00 "
        );
        assert_eq!(
            lines[4],
            "    nla_len 6, nla_type OVS_KEY_ATTR_CT_ZONE[23], data: 00 00 "
        );
        assert_eq!(lines.len(), 5, "no packet line without packet decode: {out}");
    }

    #[test]
    fn truncated_key_gets_ellipsis_and_warning() {
        let mut k = key();
        k.truncate(14);
        let lines = nlraw_lines(&tlv::decode(&k, k.len()));
        assert!(lines[1].ends_with("data: 02 00 ..."));
        assert_eq!(lines[2], "WARN: decode truncated; nla_len > msg_len[6]");
    }

    #[test]
    fn packet_line_reports_in_port() {
        let ev = event(icmp_frame()[..64].to_vec(), key());
        let out = render(PacketDecode::Hex, KeyDecode::None, &ev);
        assert!(out.contains(
            "  1: Receive dp_port 2, packet size 98 bytes, size captured 64 bytes."
        ));
        assert!(out.contains("    0000  3C FD FE 9E 7F 68 04 F4 BC 28 57 01 08 00 45 00  <....h...(W...E."));
    }

    #[test]
    fn missing_in_port_is_unknown() {
        let ev = event(icmp_frame(), Vec::new());
        let out = render(PacketDecode::Hex, KeyDecode::None, &ev);
        assert!(out.contains("Receive dp_port Unknown,"));
    }

    #[test]
    fn decode_walks_the_layers() {
        let lines = dissect(&icmp_frame());
        let text = lines.join("\n");
        assert!(text.contains("###[ Ethernet ]###"));
        assert!(text.contains("dst       = 3c:fd:fe:9e:7f:68"));
        assert!(text.contains("###[ IP ]###"));
        assert!(text.contains("src       = 1.1.1.100"));
        assert!(text.contains("proto     = icmp"));
        assert!(text.contains("flags     = DF"));
        assert!(text.contains("###[ ICMP ]###"));
        assert!(text.contains("type      = echo-request"));
        assert!(text.contains("###[ Raw ]###"));
    }

    #[test]
    fn short_frame_is_raw() {
        let lines = dissect(&[1, 2, 3]);
        assert_eq!(lines[0], "###[ Raw ]###");
    }

    #[test]
    fn zero_length_packet_is_not_dispatched() {
        let mut ev = event(Vec::new(), key());
        ev.pkt_size = 0;
        let mut presenter: Presenter<Vec<u8>, Vec<u8>> =
            Presenter::new(Vec::new(), PacketDecode::Decode, KeyDecode::None);
        let result = presenter.present(&ev).unwrap();
        assert_eq!(result.packet_id, None);
        let (out, _) = presenter.into_parts();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn packet_ids_increase_per_packet() {
        let ev = event(icmp_frame(), key());
        let mut presenter: Presenter<Vec<u8>, Vec<u8>> =
            Presenter::new(Vec::new(), PacketDecode::None, KeyDecode::None);
        assert_eq!(presenter.present(&ev).unwrap().packet_id, Some(1));
        assert_eq!(presenter.present(&ev).unwrap().packet_id, Some(2));
    }

    #[test]
    fn pcap_gets_declared_length() {
        let ev = event(icmp_frame()[..64].to_vec(), key());
        let pcap = PcapWriter::new(Vec::new(), 64).unwrap();
        let mut presenter = Presenter::new(Vec::new(), PacketDecode::None, KeyDecode::None)
            .with_pcap(pcap);
        let result = presenter.present(&ev).unwrap();
        assert!(result.pcap_written);

        let (out, pcap) = presenter.into_parts();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("1: Receive dp_port 2"));

        let bytes = pcap.unwrap().into_inner();
        let (rest, _) = pcap_parser::pcap::parse_pcap_header(&bytes).unwrap();
        let (_, frame) = pcap_parser::pcap::parse_pcap_frame(rest).unwrap();
        assert_eq!(frame.caplen, 64);
        assert_eq!(frame.origlen, 98);
    }
}
