//! Performance benchmarks for the per-message hot path.
//!
//! - Framing and reassembly of fragmented streams
//! - Envelope encoding
//! - Seal/open (compress + encrypt) for each compression algorithm

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protocol::{
    frame, query_fields, CipherKey, Compression, CryptoCodec, Envelope, Reassembler, Request,
    RequestId, StandardCodec,
};

const SIZES: &[(&str, usize)] = &[("64B", 64), ("4KB", 4096), ("64KB", 65536)];

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for (name, size) in SIZES {
        let payload = vec![0x5Au8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("frame", name), &payload, |b, payload| {
            b.iter(|| frame(black_box(payload)).unwrap());
        });
    }

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");

    // 64 frames of 1 KB delivered in 1460-byte segments.
    let mut stream = Vec::new();
    for i in 0..64u8 {
        stream.extend_from_slice(&frame(&vec![i; 1024]).unwrap());
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("segmented_64x1KB", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new();
            let mut count = 0;
            for chunk in stream.chunks(1460) {
                count += reassembler.feed(black_box(chunk)).unwrap().len();
            }
            assert_eq!(count, 64);
        });
    });

    group.bench_function("coalesced_64x1KB", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new();
            let frames = reassembler.feed(black_box(&stream)).unwrap();
            assert_eq!(frames.len(), 64);
        });
    });

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");

    let mut fields = query_fields("GetBlocksByHeights");
    fields.insert("start".to_string(), rmpv::Value::from(1u32));
    fields.insert("amount".to_string(), rmpv::Value::from(100u32));
    let envelope = Envelope::Request(Request::new(RequestId(12345), fields));
    let encoded = envelope.to_msgpack().unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&envelope).to_msgpack().unwrap());
    });
    group.bench_function("decode", |b| {
        b.iter(|| Envelope::from_msgpack(black_box(&encoded)).unwrap());
    });

    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");
    let key = CipherKey::new([7u8; 32], [9u8; 12]);

    // Compressible payload, roughly what a block listing looks like.
    let payload: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for (name, compression) in [
        ("zstd3", Compression::Zstd { level: 3 }),
        ("lz4", Compression::Lz4),
    ] {
        let codec = StandardCodec::new(compression);
        let sealed = codec.seal(payload.clone(), key).unwrap();

        group.bench_function(BenchmarkId::new("seal", name), |b| {
            b.iter(|| codec.seal(black_box(payload.clone()), key).unwrap());
        });
        group.bench_function(BenchmarkId::new("open", name), |b| {
            b.iter(|| codec.open(black_box(sealed.clone()), key).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_framing,
    bench_reassembly,
    bench_envelope,
    bench_transform
);
criterion_main!(benches);
