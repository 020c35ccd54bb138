use std::sync::{Arc, Mutex};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kcpmux::arq::{Kcp, KcpConfig};
use kcpmux::engine::ArqEngine;
use kcpmux::wire::{conversation_id, SegmentHeader};

type Wire = Arc<Mutex<Vec<Vec<u8>>>>;

fn engine(conv: u32) -> (Kcp, Wire) {
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let sink = wire.clone();
    let mut kcp = Kcp::new(conv, KcpConfig::default());
    kcp.set_output(Box::new(move |frame| sink.lock().unwrap().push(frame.to_vec())));
    (kcp, wire)
}

/// Enqueue + flush of one MTU-sized record.
fn bench_send(c: &mut Criterion) {
    let payload = vec![0xABu8; 1200];

    let mut group = c.benchmark_group("engine_send");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_and_flush", |b| {
        let quiet = || {
            let mut kcp = Kcp::new(1, KcpConfig::default());
            kcp.set_output(Box::new(|frame| {
                black_box(frame);
            }));
            kcp
        };
        let mut kcp = quiet();
        let mut now = 0u32;
        b.iter(|| {
            if !kcp.can_send() {
                // Nothing acknowledges; start over instead of stalling.
                kcp = quiet();
            }
            kcp.try_send(black_box(&payload)).unwrap();
            now += 10;
            kcp.update(now);
        });
    });

    group.finish();
}

/// Full send → input → recv round trip between two engines.
fn bench_roundtrip(c: &mut Criterion) {
    let payload = vec![0xCDu8; 1200];

    let mut group = c.benchmark_group("engine_roundtrip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_then_receive", |b| {
        let (mut tx, tx_wire) = engine(2);
        let (mut rx, rx_wire) = engine(2);
        let mut buf = vec![0u8; 4096];
        let mut now = 0u32;
        b.iter(|| {
            tx.try_send(black_box(&payload)).unwrap();
            now += 10;
            tx.update(now);
            for frame in tx_wire.lock().unwrap().drain(..) {
                rx.input(&frame).unwrap();
            }
            rx.update(now);
            for frame in rx_wire.lock().unwrap().drain(..) {
                tx.input(&frame).unwrap();
            }
            black_box(rx.recv(&mut buf).unwrap());
        });
    });

    group.finish();
}

/// The demultiplexer's per-datagram classification.
fn bench_classify(c: &mut Criterion) {
    let mut frame = Vec::with_capacity(64);
    SegmentHeader {
        conv: 0xDEAD_BEEF,
        cmd: kcpmux::wire::Command::Push,
        frg: 0,
        wnd: 128,
        ts: 1,
        sn: 2,
        una: 3,
        len: 0,
    }
    .encode(&mut frame);

    c.bench_function("conversation_id", |b| {
        b.iter(|| black_box(conversation_id(black_box(&frame))))
    });
}

criterion_group!(benches, bench_send, bench_roundtrip, bench_classify);
criterion_main!(benches);
