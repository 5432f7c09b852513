//! Performance benchmarks for RecordCodec.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use benchlink_core::Address;
use benchlink_protocol::{RecordCodec, Reply, Request};
use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

fn query_record() -> String {
    Request::query(Address::new("GPIB0::8::INSTR").unwrap(), "MEAS:VOLT:DC? 10,0.001").to_string()
}

/// Reply the size of a short trace dump from a scope or VNA.
fn trace_reply(points: usize) -> String {
    let data: Vec<String> = (0..points).map(|i| format!("{:.6E}", i as f64 * 1.5e-3)).collect();
    Reply::Data(data.join(",")).to_string()
}

/// Benchmark encoding a short request.
fn bench_encode_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_request");
    group.throughput(Throughput::Elements(1));

    let record = query_record();

    group.bench_function("encode_query", |b| {
        b.iter(|| {
            let mut codec = RecordCodec::new();
            let mut buffer = BytesMut::new();
            codec.encode(black_box(record.clone()), &mut buffer).unwrap();
            black_box(buffer);
        });
    });

    group.finish();
}

/// Benchmark decoding data replies of increasing size.
fn bench_decode_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_reply");

    for points in [1usize, 100, 2000] {
        let mut encoded = BytesMut::new();
        RecordCodec::new()
            .encode(trace_reply(points), &mut encoded)
            .unwrap();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(points), &encoded, |b, encoded| {
            b.iter(|| {
                let mut codec = RecordCodec::new();
                let mut buffer = encoded.clone();
                black_box(codec.decode(&mut buffer).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark decoding a batch of back-to-back requests from one buffer.
fn bench_decode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_batch");
    let batch = 100;
    group.throughput(Throughput::Elements(batch as u64));

    let mut encoded = BytesMut::new();
    let mut codec = RecordCodec::new();
    for _ in 0..batch {
        codec.encode(query_record(), &mut encoded).unwrap();
    }

    group.bench_function("decode_100_requests", |b| {
        b.iter(|| {
            let mut codec = RecordCodec::new();
            let mut buffer = encoded.clone();
            while let Some(record) = codec.decode(&mut buffer).unwrap() {
                black_box(record);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_request,
    bench_decode_reply,
    bench_decode_batch
);
criterion_main!(benches);
