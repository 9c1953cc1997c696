use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use portal_codec::crypto::{sign, KeySet, SignMethod};
use portal_codec::Message;

fn criterion_benchmark(c: &mut Criterion) {
    let mut keys = KeySet::default();
    keys.push(SignMethod::Sha256, "00112233445566778899aabbccddeeff")
        .unwrap();

    let line = keys.sign("REDIRECT 1700000000 127.0.0.1:9001 PID:4242 web:/shop/cart");

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("verify_and_parse", |bencher| {
        bencher.iter(|| {
            let body = keys.verify(&line).unwrap();
            Message::parse(body).unwrap();
        })
    });

    group.bench_function("sign", |bencher| {
        bencher.iter(|| sign(b"00112233445566778899aabbccddeeff", line.as_bytes()))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
