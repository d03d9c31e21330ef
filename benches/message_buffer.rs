//! Incremental message parsing benchmarks
//!
//! Run with: cargo bench --bench message_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rpcwire::http::{AcceptedEncodings, HttpRequest, HttpResponse, Method, MessageBuffer, Status};
use std::time::Duration;

fn request_wire(body_size: usize) -> Vec<u8> {
    HttpRequest::builder()
        .method(Method::Post)
        .uri("/RPC2")
        .header("Host", "localhost:8080")
        .header("User-Agent", "rpcwire-bench")
        .header("Content-Type", "text/xml")
        .header("Accept-Encoding", "gzip, deflate;q=0.5")
        .body(vec![b'x'; body_size])
        .build()
        .to_wire()
}

fn response_wire(body_size: usize) -> Vec<u8> {
    HttpResponse::builder()
        .status(Status::OK)
        .header("Server", "rpcwire-bench")
        .header("Content-Type", "text/xml")
        .body(vec![b'y'; body_size])
        .build()
        .to_wire()
}

fn bench_parse_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");

    for size in [0usize, 1024, 16384, 262144].iter() {
        let wire = request_wire(*size);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut buffer = MessageBuffer::request();
                buffer.feed(black_box(wire)).unwrap();
                black_box(buffer.into_request().unwrap());
            });
        });
    }

    group.finish();
}

fn bench_parse_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_response");

    for size in [0usize, 1024, 16384].iter() {
        let wire = response_wire(*size);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut buffer = MessageBuffer::response();
                buffer.feed(black_box(wire)).unwrap();
                black_box(buffer.into_response().unwrap());
            });
        });
    }

    group.finish();
}

fn bench_fragmented_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmented_feed");
    let wire = request_wire(512);
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for chunk in [1usize, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), chunk, |b, &chunk| {
            b.iter(|| {
                let mut buffer = MessageBuffer::request();
                for piece in wire.chunks(chunk) {
                    buffer.feed(black_box(piece)).unwrap();
                }
                assert!(buffer.is_complete());
            });
        });
    }

    group.finish();
}

fn bench_accept_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("accept_encoding");

    group.bench_function("simple", |b| {
        b.iter(|| black_box(AcceptedEncodings::parse(black_box("gzip")).unwrap()));
    });

    group.bench_function("weighted", |b| {
        b.iter(|| {
            black_box(
                AcceptedEncodings::parse(black_box("br;q=1.0, gzip;q=0.8, deflate;q=0.5, identity;q=0.1, *;q=0"))
                    .unwrap(),
            )
        });
    });

    group.finish();
}

criterion_group! {
    name = parsing;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_parse_request, bench_parse_response, bench_fragmented_feed
}

criterion_group!(negotiation, bench_accept_encoding);

criterion_main!(parsing, negotiation);
