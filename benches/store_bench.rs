//! Server store and stats benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_tunnel::server::{ServerEntry, ServerEntryFields, ServerEntryStore};

fn encoded(i: usize) -> String {
    ServerEntryFields {
        ip_address: format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256),
        web_server_port: 8443,
        web_server_secret: "secret".into(),
        web_server_certificate: "Y2VydA==".into(),
        ssh_port: 22,
        ssh_username: "user".into(),
        ssh_password: "pass".into(),
        ssh_obfuscated_port: 443,
        ..Default::default()
    }
    .encode()
    .unwrap()
}

fn bench_entry_decode(c: &mut Criterion) {
    let raw = encoded(1);

    let mut group = c.benchmark_group("server_entry");
    group.throughput(Throughput::Elements(1));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(ServerEntry::decode(black_box(&raw)).unwrap()))
    });
    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let batch: Vec<String> = (0..500).map(encoded).collect();

    let mut group = c.benchmark_group("server_store");
    group.throughput(Throughput::Elements(batch.len() as u64));

    group.bench_function("merge_new_batch", |b| {
        b.iter(|| {
            let store = ServerEntryStore::in_memory();
            black_box(store.merge_discovered(&batch, true))
        })
    });

    let store = ServerEntryStore::in_memory();
    store.merge_discovered(&batch, false);
    group.bench_function("merge_known_batch", |b| {
        b.iter(|| black_box(store.merge_discovered(&batch, false)))
    });

    group.bench_function("mark_current_failed", |b| {
        b.iter(|| {
            store.set_current_server_entry();
            store.mark_current_failed();
        })
    });

    group.finish();
}

fn bench_stats(c: &mut Criterion) {
    use relay_tunnel::config::StatsConfig;
    use relay_tunnel::statistic::{RegexReplace, StatsReporter};

    let stats = StatsReporter::new(&StatsConfig::default());
    stats.set_regexes(
        &[RegexReplace {
            regex: r"^http://(www\.)?example\.com/.*$".into(),
            replace: "example.com".into(),
        }],
        &[RegexReplace {
            regex: r"^(.*\.)?example\.org$".into(),
            replace: "example.org".into(),
        }],
    );

    let mut group = c.benchmark_group("stats");
    group.throughput(Throughput::Elements(1));

    group.bench_function("page_view_match", |b| {
        b.iter(|| stats.record_page_view(black_box("http://www.example.com/index.html")))
    });

    group.bench_function("https_request_miss", |b| {
        b.iter(|| stats.record_https_request(black_box("unknown.example.net")))
    });

    group.finish();
}

criterion_group!(benches, bench_entry_decode, bench_store, bench_stats);
criterion_main!(benches);
