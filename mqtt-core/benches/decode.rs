use criterion::{criterion_group, criterion_main, Criterion};

use mqtt_core::unpack;

fn bench_decode_connect(c: &mut Criterion) {
    let buf = b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\
\x0512345\x00\x04user\x00\x04pass";

    c.bench_function("decode connect", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

fn bench_decode_connect_ack(c: &mut Criterion) {
    let buf = b"\x20\x02\x01\x04";

    c.bench_function("decode connack", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

fn bench_decode_publish(c: &mut Criterion) {
    let buf = b"\x3d\x0D\x00\x05topic\x43\x21data";

    c.bench_function("decode publish", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

fn bench_decode_subscribe(c: &mut Criterion) {
    let buf = b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02";

    c.bench_function("decode subscribe", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

fn bench_decode_subscribe_ack(c: &mut Criterion) {
    let buf = b"\x90\x05\x12\x34\x01\x80\x02";

    c.bench_function("decode suback", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

fn bench_decode_unsubscribe(c: &mut Criterion) {
    let buf = b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter";

    c.bench_function("decode unsubscribe", |b| {
        b.iter(|| unpack(buf, 1 << 16).unwrap())
    });
}

criterion_group!(
    benches,
    bench_decode_connect,
    bench_decode_connect_ack,
    bench_decode_publish,
    bench_decode_subscribe,
    bench_decode_subscribe_ack,
    bench_decode_unsubscribe
);
criterion_main!(benches);
