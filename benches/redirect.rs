use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use portal::redirect::RedirectTable;

fn criterion_benchmark(c: &mut Criterion) {
    let table = RedirectTable::default();
    for i in 0..128 {
        table
            .add_or_renew(format!("/service-{i}/api"), None, "10.0.0.1:9000".into(), false, None, true, 0)
            .unwrap();
    }

    let mut group = c.benchmark_group("redirect");
    group.throughput(Throughput::Elements(1));

    group.bench_function("resolve_longest_prefix", |bencher| {
        bencher.iter(|| table.resolve("/service-64/api/cart/items"))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
