//! Wire codec benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use snapshare_core::{PeerToken, Reliability};
use snapshare_wire::{
    split_chunks, Beacon, DataFrame, Datagram, LinkMessage, Packet, Sealed, MAX_CHUNK_SIZE,
};

fn bench_beacon(c: &mut Criterion) {
    let datagram = Datagram::new(
        PeerToken::new(0x1234),
        Packet::Beacon(Beacon::announce("selfie-share", "Alice's phone")),
    );
    let encoded = datagram.encode().unwrap();

    let mut group = c.benchmark_group("beacon");
    group.bench_function("encode", |b| b.iter(|| black_box(&datagram).encode().unwrap()));
    group.bench_function("decode", |b| {
        b.iter(|| Datagram::decode(black_box(encoded.clone())).unwrap())
    });
    group.finish();
}

fn bench_data(c: &mut Criterion) {
    let message = LinkMessage::Data(DataFrame {
        channel: Reliability::Reliable,
        seq: 42,
        message_id: 7,
        index: 0,
        count: 1,
        chunk: Bytes::from(vec![0xA5u8; MAX_CHUNK_SIZE]),
    });
    let plaintext = Bytes::from(message.encode());
    let sealed = Datagram::new(
        PeerToken::new(1),
        Packet::Sealed(Sealed {
            counter: 9,
            ciphertext: plaintext.clone(),
        }),
    )
    .encode()
    .unwrap();

    let mut group = c.benchmark_group("data");
    group.throughput(Throughput::Bytes(MAX_CHUNK_SIZE as u64));
    group.bench_function("link_encode", |b| b.iter(|| black_box(&message).encode()));
    group.bench_function("link_decode", |b| {
        b.iter(|| LinkMessage::decode(black_box(plaintext.clone())).unwrap())
    });
    group.bench_function("datagram_decode", |b| {
        b.iter(|| Datagram::decode(black_box(sealed.clone())).unwrap())
    });
    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 512 * 1024]);
    let mut group = c.benchmark_group("split");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("512k", |b| b.iter(|| split_chunks(black_box(&payload))));
    group.finish();
}

criterion_group!(benches, bench_beacon, bench_data, bench_split);
criterion_main!(benches);
