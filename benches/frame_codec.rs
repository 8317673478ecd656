//! Benchmarks for the wire codec
//!
//! Measures:
//! - Encoding data frames of typical carriage sizes
//! - Streaming decode of back-to-back frames
//! - Peeking the tag without a full decode (the dispatcher's hot path)

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::Decoder;
use zipmesh::frame::{DataFrame, FrameCodec, TypedFrame};
use zipmesh::test_utils::{encoded_batch, sample_data_frame, sample_frame};

const SIZES: [usize; 3] = [64, 4 * 1024, 64 * 1024];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in SIZES {
        let data = sample_data_frame(0x10, size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 128);
            b.iter(|| {
                buf.clear();
                let frame = data.to_frame().expect("encode data frame");
                frame.encode_into(&mut buf).expect("encode frame");
                black_box(buf.len())
            })
        });
    }
    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");
    for size in SIZES {
        let batch = encoded_batch(64, size);
        group.throughput(Throughput::Bytes(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let mut buf = batch.clone();
                let mut codec = FrameCodec::new();
                let mut frames = 0;
                while let Some(frame) = codec.decode(&mut buf).expect("decode") {
                    black_box(&frame);
                    frames += 1;
                }
                black_box(frames)
            })
        });
    }
    group.finish();
}

fn bench_peek_tag(c: &mut Criterion) {
    let frame = sample_frame(0x10, 4 * 1024);
    c.bench_function("peek_tag", |b| b.iter(|| black_box(DataFrame::peek_tag(black_box(&frame)))));
    c.bench_function("full_decode", |b| b.iter(|| black_box(DataFrame::from_frame(black_box(&frame)))));
}

criterion_group!(benches, bench_encode, bench_stream_decode, bench_peek_tag);
criterion_main!(benches);
