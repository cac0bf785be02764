use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pcap_parser::pcap;
use pnet_base::MacAddr;
use upcall_monitor::fake_events::{DemoFlow, build_frame, build_key};
use upcall_monitor::metrics::Metrics;
use upcall_monitor::pcap::PcapWriter;
use upcall_monitor::present::{KeyDecode, PacketDecode, Presenter};
use upcall_monitor::{Capacities, CapturePipeline, MemoryRing, PipelineState, UpcallEvent};

fn icmp_upcall(seq: u16, in_port: u32) -> UpcallEvent {
    let flow = DemoFlow::IcmpEcho { id: 0x1234, seq };
    let frame = build_frame(
        MacAddr::new(0x04, 0xf4, 0xbc, 0x28, 0x57, 0x01),
        MacAddr::new(0x3c, 0xfd, 0xfe, 0x9e, 0x7f, 0x68),
        Ipv4Addr::new(1, 1, 1, 100),
        Ipv4Addr::new(1, 1, 1, 123),
        flow,
    );
    let key = build_key(in_port, &frame, flow);
    UpcallEvent {
        ts_ns: 1_000_000_000 * u64::from(seq),
        cpu: 0,
        pid: 3_001,
        comm: "handler1".into(),
        dpif_name: "system@ovs-system".into(),
        upcall_type: 0,
        pkt_size: frame.len() as u32,
        key_size: key.len() as u64,
        packet: frame,
        key,
    }
}

#[tokio::test(start_paused = true)]
async fn nlraw_session_with_pcap() {
    // 100 bytes of key stop inside the IPv4 attribute.
    let caps = Capacities::new(128, 100).unwrap();
    let ring = MemoryRing::with_slots(16, caps.record_size());
    let producer = ring.producer();
    producer.write(&icmp_upcall(1, 3).encode(caps)).unwrap();
    producer.write(&icmp_upcall(2, 3).encode(caps)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upcalls.pcap");
    let presenter: Presenter<Vec<u8>> = Presenter::new(Vec::new(), PacketDecode::Decode, KeyDecode::Nlraw)
        .with_pcap(PcapWriter::create(&path, caps.packet).unwrap());
    let metrics = Arc::new(Metrics::new());
    let mut pipeline = CapturePipeline::new(ring, caps, presenter, Arc::clone(&metrics));

    let summary = pipeline.run(async {}).await.unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.dropped, 0);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(metrics.key_truncations(), 2);
    assert_eq!(metrics.pcap_packets(), 2);

    let (out, pcap_writer) = pipeline.into_presenter().into_parts();
    let mut pcap_writer = pcap_writer.unwrap();
    pcap_writer.flush().unwrap();
    drop(pcap_writer);

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("TIME"));
    assert!(text.contains("system@ovs-system"));
    assert!(text.contains("  Flow key size 112 bytes, size captured 100 bytes."));
    assert!(text.contains("nla_type OVS_KEY_ATTR_IN_PORT[3], data: 03 00 00 00"));
    assert!(text.contains("WARN: decode truncated; nla_len > msg_len[12]"));
    assert!(text.contains("  1: Receive dp_port 3, packet size 98 bytes, size captured 98 bytes."));
    assert!(text.contains("  2: Receive dp_port 3, packet size 98 bytes"));
    assert!(text.contains("###[ ICMP ]###"));

    let bytes = std::fs::read(&path).unwrap();
    let (rest, header) = pcap::parse_pcap_header(&bytes).unwrap();
    assert_eq!(header.snaplen, 128);
    let (rest, first) = pcap::parse_pcap_frame(rest).unwrap();
    assert_eq!(first.ts_sec, 1);
    assert_eq!(first.caplen, 98);
    assert_eq!(first.origlen, 98);
    let (rest, second) = pcap::parse_pcap_frame(rest).unwrap();
    assert_eq!(second.ts_sec, 2);
    assert!(rest.is_empty());
}

#[tokio::test(start_paused = true)]
async fn overflow_is_reported_after_drain() {
    let caps = Capacities::new(64, 64).unwrap();
    let ring = MemoryRing::with_slots(2, caps.record_size());
    let producer = ring.producer();
    for seq in 1..=5 {
        let _ = producer.write(&icmp_upcall(seq, 1).encode(caps));
    }
    assert_eq!(producer.overflow_count(), 3);

    let presenter: Presenter<Vec<u8>> = Presenter::new(Vec::new(), PacketDecode::None, KeyDecode::None);
    let metrics = Arc::new(Metrics::new());
    let mut pipeline = CapturePipeline::new(ring, caps, presenter, Arc::clone(&metrics))
        .with_poll_interval(Duration::from_millis(50));

    let summary = pipeline
        .run(tokio::time::sleep(Duration::from_millis(120)))
        .await
        .unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.dropped, 3);

    let (out, _) = pipeline.into_presenter().into_parts();
    // Header plus one row per delivered record, nothing else in this mode.
    assert_eq!(String::from_utf8(out).unwrap().lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn hex_key_without_packet_line() {
    let caps = Capacities::new(64, 128).unwrap();
    let ring = MemoryRing::with_slots(4, caps.record_size());
    ring.producer()
        .write(&icmp_upcall(1, 2).encode(caps))
        .unwrap();

    let presenter: Presenter<Vec<u8>> = Presenter::new(Vec::new(), PacketDecode::None, KeyDecode::Hex);
    let mut pipeline = CapturePipeline::new(ring, caps, presenter, Arc::new(Metrics::new()));
    pipeline.run(async {}).await.unwrap();

    let (out, _) = pipeline.into_presenter().into_parts();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("  Flow key size 112 bytes, size captured 112 bytes."));
    assert!(text.contains("    0000  08 00 14 00"));
    assert!(!text.contains("Receive dp_port"));
}
