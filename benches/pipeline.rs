//! Extraction, reconciliation and batch scoring throughput.

use std::hint::black_box;
use std::net::Ipv4Addr;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::tcp::MutableTcpPacket;

use vajra_ddos::capture::CapturedPacket;
use vajra_ddos::features::{names, LinkType};
use vajra_ddos::model::TreeEnsemble;
use vajra_ddos::{extract_features, CanonicalSchema, ClassifierAdapter, DetectionRuntime, Extraction, Reconciler};

fn tcp_frame(i: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 54];
    MutableEthernetPacket::new(&mut buf)
        .unwrap()
        .set_ethertype(EtherTypes::Ipv4);
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(40);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(Ipv4Addr::new(10, 0, (i >> 8) as u8, i as u8));
        ip.set_destination(Ipv4Addr::new(10, 0, 255, 1));
    }
    {
        let mut tcp = MutableTcpPacket::new(&mut buf[34..]).unwrap();
        tcp.set_source(1024 + i);
        tcp.set_destination(80);
        tcp.set_data_offset(5);
        tcp.set_flags(if i % 4 == 0 { 0x02 } else { 0x18 });
    }
    buf
}

/// Depth-three tree over the SYN, PSH and destination port columns.
fn forest(schema: &CanonicalSchema, trees: usize) -> TreeEnsemble {
    let syn = schema.index_of(names::TCP_FLAGS_SYN).unwrap();
    let psh = schema.index_of(names::TCP_FLAGS_PUSH).unwrap();
    let port = schema.index_of(names::TCP_DSTPORT).unwrap();
    let tree = format!(
        r#"{{"nodes": [
            {{"feature": {syn}, "threshold": 0.5, "left": 1, "right": 4}},
            {{"feature": {psh}, "threshold": 0.5, "left": 2, "right": 3}},
            {{"value": [8, 2]}}, {{"value": [9, 1]}},
            {{"feature": {port}, "threshold": 1024, "left": 5, "right": 6}},
            {{"value": [1, 9]}}, {{"value": [4, 6]}}]}}"#
    );
    let json = format!(
        r#"{{"n_features": {}, "classes": [0, 1], "trees": [{}]}}"#,
        schema.len(),
        vec![tree; trees].join(",")
    );
    TreeEnsemble::from_json(&json).unwrap()
}

fn schema() -> Arc<CanonicalSchema> {
    let names: Vec<String> = names::PACKET_FEATURES.iter().map(|s| s.to_string()).collect();
    Arc::new(CanonicalSchema::unscaled(names).unwrap())
}

fn extract_benchmark(c: &mut Criterion) {
    let frame = tcp_frame(7);
    let reconciler = Reconciler::new(schema());

    let mut group = c.benchmark_group("per_packet");
    group.bench_function("extract", |b| {
        b.iter(|| black_box(extract_features(black_box(&frame), LinkType::Ethernet)))
    });
    group.bench_function("extract_reconcile", |b| {
        b.iter(|| match extract_features(black_box(&frame), LinkType::Ethernet) {
            Extraction::Features(f) => black_box(reconciler.reconcile(&f.raw)),
            Extraction::Skip(_) => unreachable!(),
        })
    });
    group.finish();
}

fn offline_benchmark(c: &mut Criterion) {
    let schema = schema();
    let packets: Vec<CapturedPacket> = (0..2048u16)
        .map(|i| CapturedPacket {
            index: i as usize,
            link: LinkType::Ethernet,
            data: tcp_frame(i),
        })
        .collect();

    let mut group = c.benchmark_group("offline_replay");
    for workers in [1usize, 4].iter() {
        let model = forest(&schema, 100);
        let classifier = Arc::new(
            ClassifierAdapter::new(Box::new(model), schema.len())
                .with_workers(*workers)
                .unwrap(),
        );
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, _| {
            b.iter(|| {
                let runtime = DetectionRuntime::from_parts(schema.clone(), classifier.clone());
                black_box(runtime.run_offline(&packets, packets.len()).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, extract_benchmark, offline_benchmark);
criterion_main!(benches);
