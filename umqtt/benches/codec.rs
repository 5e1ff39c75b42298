//! Benchmarks for frame encoding, decoding and stream framing.
//!
//! Run with: cargo bench -p umqtt

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use umqtt::{Connect, Frame, Publish, QoS, StreamFramer, Subscribe, codec};

fn bench_remaining_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("remaining_length");

    for value in [127usize, 16_383, 2_097_151, 268_435_455] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &v| {
            b.iter(|| codec::encode_remaining_length(black_box(v)));
        });

        let encoded = codec::encode_remaining_length(value);
        group.bench_with_input(BenchmarkId::new("decode", value), &encoded, |b, buf| {
            b.iter(|| codec::decode_remaining_length(black_box(buf)));
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let connect = Frame::Connect(
        Connect::new("bench-client")
            .with_keep_alive(60)
            .with_credentials(Some("user".to_string()), Some("password".into())),
    );
    c.bench_function("encode/connect", |b| b.iter(|| codec::encode(black_box(&connect))));

    let subscribe = Frame::Subscribe(
        Subscribe::new(vec!["a/+", "b/#", "c"], vec![QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce], 1)
            .expect("valid subscribe"),
    );
    c.bench_function("encode/subscribe", |b| b.iter(|| codec::encode(black_box(&subscribe))));

    let mut group = c.benchmark_group("encode/publish");
    for size in [64usize, 1024, 16_384] {
        let publish = Frame::Publish(Publish::new("bench/topic", vec![0u8; size]));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &publish, |b, frame| {
            b.iter(|| codec::encode(black_box(frame)));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode/publish");
    for size in [64usize, 1024, 16_384] {
        let encoded = codec::encode(&Frame::Publish(Publish::new("bench/topic", vec![0u8; size])))
            .expect("encodable publish");
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, buf| {
            b.iter(|| codec::decode(black_box(buf)));
        });
    }
    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let packet = codec::encode(&Frame::Publish(Publish::new("bench/topic", vec![0u8; 256])))
        .expect("encodable publish");
    let stream: Vec<u8> = packet.iter().copied().cycle().take(packet.len() * 100).collect();

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [1usize, 64, 4096] {
        group.bench_with_input(BenchmarkId::new("feed", chunk_size), &chunk_size, |b, &size| {
            b.iter(|| {
                let mut framer = StreamFramer::new();
                let mut count = 0;
                for chunk in stream.chunks(size) {
                    count += framer.feed(chunk).expect("well formed stream").len();
                }
                count
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_remaining_length, bench_encode, bench_decode, bench_framer);
criterion_main!(benches);
