//! Synthetic upcall producers for `--demo`.
//!
//! One thread per simulated CPU writes records shaped like the probe's into
//! an in-process ring: ICMP echo requests and UDP datagrams with flow keys
//! that describe them.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};
use nix::time::{ClockId, clock_gettime};
use pnet_packet::MutablePacket;
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::icmp::{self, IcmpCode, IcmpTypes, MutableIcmpPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::udp::MutableUdpPacket;
use pnet_base::MacAddr;
use rand::Rng;

use crate::record::{Capacities, UpcallEvent};
use crate::registry::attr;
use crate::ring::RingProducer;
use crate::tlv;

const ETH_HLEN: usize = 14;
const IPV4_HLEN: usize = 20;
const UDP_HLEN: usize = 8;
const ICMP_ECHO_HLEN: usize = 8;

const UPCALL_MISS: u32 = 0;
const UPCALL_ACTION: u32 = 1;

const DEMO_DPIF: &str = "system@ovs-system";
const DEMO_PID_BASE: u32 = 40_000;

/// Shape of one synthetic flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoFlow {
    IcmpEcho { id: u16, seq: u16 },
    Udp { sport: u16, dport: u16, payload: usize },
}

fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Build an Ethernet/IPv4 frame for `flow`.
pub fn build_frame(
    src: MacAddr,
    dst: MacAddr,
    saddr: Ipv4Addr,
    daddr: Ipv4Addr,
    flow: DemoFlow,
) -> Vec<u8> {
    let l4_len = match flow {
        DemoFlow::IcmpEcho { .. } => ICMP_ECHO_HLEN + 56,
        DemoFlow::Udp { payload, .. } => UDP_HLEN + payload,
    };
    let mut buf = vec![0u8; ETH_HLEN + IPV4_HLEN + l4_len];

    if let Some(mut eth) = MutableEthernetPacket::new(&mut buf) {
        eth.set_destination(dst);
        eth.set_source(src);
        eth.set_ethertype(EtherTypes::Ipv4);
    }

    let ip_buf = &mut buf[ETH_HLEN..];
    if let Some(mut ip) = MutableIpv4Packet::new(ip_buf) {
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_HLEN + l4_len) as u16);
        ip.set_identification(rand::thread_rng().r#gen());
        ip.set_flags(0b010);
        ip.set_ttl(64);
        ip.set_source(saddr);
        ip.set_destination(daddr);

        match flow {
            DemoFlow::IcmpEcho { id, seq } => {
                ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
                if let Some(mut echo) = MutableIcmpPacket::new(ip.payload_mut()) {
                    echo.set_icmp_type(IcmpTypes::EchoRequest);
                    echo.set_icmp_code(IcmpCode(0));
                    let rest = echo.payload_mut();
                    rest[..2].copy_from_slice(&id.to_be_bytes());
                    rest[2..4].copy_from_slice(&seq.to_be_bytes());
                    let csum = icmp::checksum(&echo.to_immutable());
                    echo.set_checksum(csum);
                }
            }
            DemoFlow::Udp { sport, dport, .. } => {
                ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
                if let Some(mut udp) = MutableUdpPacket::new(ip.payload_mut()) {
                    udp.set_source(sport);
                    udp.set_destination(dport);
                    udp.set_length(l4_len as u16);
                }
            }
        }
        let csum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(csum);
    }
    buf
}

/// Flow key the datapath would send for `frame` arriving on `in_port`.
pub fn build_key(in_port: u32, frame: &[u8], flow: DemoFlow) -> Vec<u8> {
    let eth = &frame[..12];
    let ip = &frame[ETH_HLEN..ETH_HLEN + IPV4_HLEN];
    let mut ipv4_key = [0u8; 12];
    ipv4_key[..4].copy_from_slice(&ip[12..16]);
    ipv4_key[4..8].copy_from_slice(&ip[16..20]);
    ipv4_key[8] = ip[9];
    ipv4_key[9] = ip[1];
    ipv4_key[10] = ip[8];

    let l4: Vec<u8> = match flow {
        DemoFlow::IcmpEcho { .. } => vec![8, 0],
        DemoFlow::Udp { sport, dport, .. } => {
            let mut v = sport.to_be_bytes().to_vec();
            v.extend_from_slice(&dport.to_be_bytes());
            v
        }
    };
    let l4_attr = match flow {
        DemoFlow::IcmpEcho { .. } => attr::ICMP,
        DemoFlow::Udp { .. } => attr::UDP,
    };

    let zero = [0u8; 4];
    let port = in_port.to_ne_bytes();
    tlv::encode([
        (attr::RECIRC_ID, &zero[..]),
        (attr::DP_HASH, &zero[..]),
        (attr::PRIORITY, &zero[..]),
        (attr::IN_PORT, &port[..]),
        (attr::SKB_MARK, &zero[..]),
        (attr::CT_STATE, &zero[..]),
        (attr::CT_ZONE, &zero[..2]),
        (attr::CT_MARK, &zero[..]),
        (attr::ETHERNET, eth),
        (attr::ETHERTYPE, &[0x08, 0x00][..]),
        (attr::IPV4, &ipv4_key[..]),
        (l4_attr, &l4[..]),
    ])
}

fn generate(rng: &mut impl Rng, cpu: u32, seq: u16) -> UpcallEvent {
    let in_port = rng.gen_range(1..=4u32);
    let src = MacAddr::new(0x04, 0xf4, 0xbc, 0x28, 0x57, in_port as u8);
    let dst = MacAddr::new(0x3c, 0xfd, 0xfe, 0x9e, 0x7f, 0x68);
    let saddr = Ipv4Addr::new(10, 0, in_port as u8, rng.gen_range(2..250));
    let daddr = Ipv4Addr::new(10, 0, 0, 1);

    let flow = if rng.gen_bool(0.5) {
        DemoFlow::IcmpEcho {
            id: rng.r#gen(),
            seq,
        }
    } else {
        DemoFlow::Udp {
            sport: rng.gen_range(1024..65535),
            dport: 4789,
            payload: rng.gen_range(18..1400),
        }
    };
    let frame = build_frame(src, dst, saddr, daddr, flow);
    let key = build_key(in_port, &frame, flow);

    UpcallEvent {
        ts_ns: monotonic_ns(),
        cpu,
        pid: DEMO_PID_BASE + cpu,
        comm: format!("handler{}", cpu + 1),
        dpif_name: DEMO_DPIF.to_string(),
        upcall_type: if rng.gen_ratio(1, 10) {
            UPCALL_ACTION
        } else {
            UPCALL_MISS
        },
        pkt_size: frame.len() as u32,
        key_size: key.len() as u64,
        packet: frame,
        key,
    }
}

/// Running producer threads. Stopped on [`DemoProducers::stop`] or drop.
pub struct DemoProducers {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl DemoProducers {
    /// Start `cpus` producers, each writing about `rate` records per second.
    pub fn spawn(producer: RingProducer, caps: Capacities, cpus: u32, rate: u64) -> Self {
        // Avoid 0ms intervals. Clamp to at least 1ms.
        let period = if rate == 0 {
            Duration::from_millis(1000)
        } else {
            std::cmp::max(
                Duration::from_millis(1),
                Duration::from_secs_f64(1.0 / rate as f64),
            )
        };
        info!("demo: {cpus} producer(s), one record every {period:?} each");

        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..cpus)
            .map(|cpu| {
                let producer = producer.clone();
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut seq: u16 = 0;
                    while !stop.load(Ordering::Relaxed) {
                        seq = seq.wrapping_add(1);
                        let ev = generate(&mut rng, cpu, seq);
                        // Overflow is counted by the ring.
                        let _ = producer.write(&ev.encode(caps));
                        std::thread::sleep(period);
                    }
                    debug!("demo producer {cpu} stopped");
                })
            })
            .collect();

        Self { stop, handles }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DemoProducers {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::present::dissect;
    use crate::ring::{MemoryRing, RecordSource};

    #[test]
    fn icmp_frame_dissects() {
        let flow = DemoFlow::IcmpEcho { id: 7, seq: 1 };
        let frame = build_frame(
            MacAddr::new(2, 0, 0, 0, 0, 1),
            MacAddr::new(2, 0, 0, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            flow,
        );
        assert_eq!(frame.len(), 98);
        let text = dissect(&frame).join("\n");
        assert!(text.contains("proto     = icmp"));
        assert!(text.contains("type      = echo-request"));
    }

    #[test]
    fn key_describes_frame() {
        let flow = DemoFlow::Udp {
            sport: 5000,
            dport: 4789,
            payload: 32,
        };
        let frame = build_frame(
            MacAddr::new(2, 0, 0, 0, 0, 1),
            MacAddr::new(2, 0, 0, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            flow,
        );
        let key = build_key(3, &frame, flow);
        let decoded = tlv::decode(&key, key.len());
        assert!(decoded.diagnostics.is_empty());
        assert_eq!(decoded.in_port(), Some(3));
        assert_eq!(decoded.get(attr::UDP), Some(&[0x13, 0x88, 0x12, 0xb5][..]));
        assert_eq!(decoded.get(attr::IPV4).map(|v| v[8]), Some(17));
        assert_eq!(decoded.attributes.len(), 12);
    }

    #[test]
    fn producers_fill_the_ring() {
        let caps = Capacities::new(128, 256).unwrap();
        let mut ring = MemoryRing::with_slots(256, caps.record_size());
        let producers = DemoProducers::spawn(ring.producer(), caps, 2, 1000);
        std::thread::sleep(Duration::from_millis(50));
        producers.stop();

        let records = ring.drain_until_empty();
        assert!(!records.is_empty());
        let ev = UpcallEvent::from_bytes(&records[0], caps);
        assert_eq!(ev.dpif_name, DEMO_DPIF);
        assert!(ev.comm.starts_with("handler"));
        assert!(ev.pkt_size >= 60);
    }
}
