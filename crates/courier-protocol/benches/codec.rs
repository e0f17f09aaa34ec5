//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::codec::{self, Encoding};
use courier_protocol::{Message, MessageType};
use serde_json::json;

fn sample(size: usize) -> Message {
    Message::new(MessageType::RoomMessage, json!({"text": "x".repeat(size)}))
        .with_from("user-1", "Alice")
        .with_room("lobby")
}

fn bench_encode(c: &mut Criterion) {
    let msg = sample(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_as(black_box(&msg), Encoding::Json))
    });
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::encode_as(black_box(&msg), Encoding::MessagePack))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let msg = sample(1024);
    let json = codec::encode_as(&msg, Encoding::Json).unwrap();
    let msgpack = codec::encode_as(&msg, Encoding::MessagePack).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(json.len() as u64));
    group.bench_function("json_1KB", |b| {
        b.iter(|| codec::decode_as(black_box(&json), Encoding::Json))
    });
    group.throughput(Throughput::Bytes(msgpack.len() as u64));
    group.bench_function("msgpack_1KB", |b| {
        b.iter(|| codec::decode_as(black_box(&msgpack), Encoding::MessagePack))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
