//! Subscription matching benchmarks
//!
//! Run with: `cargo bench --bench matching`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use vibemesh::hash;
use vibemesh::message::Message;
use vibemesh::security::Channel;
use vibemesh::topic::{MatchStrategy, Subscriber, SubscriberKind, SubscriptionTrie};

struct Sink(u64);

impl Subscriber for Sink {
    fn id(&self) -> u64 {
        self.0
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Direct
    }

    fn send(&self, _msg: &Message) -> bool {
        true
    }
}

fn ssid(contract: u32, path: &str) -> Vec<u32> {
    let mut out = vec![contract];
    out.extend(path.split('/').map(hash::of));
    out
}

/// A trie holding `n` exact subscriptions plus a few wildcards.
fn populated(strategy: MatchStrategy, n: u64) -> SubscriptionTrie {
    let trie = SubscriptionTrie::new(strategy);
    for i in 0..n {
        let path = format!("sensors/{}/temp", i % 1000);
        trie.subscribe(&ssid(1, &path), Arc::new(Sink(i))).unwrap();
    }
    trie.subscribe(&ssid(1, "sensors/+/temp"), Arc::new(Sink(n + 1))).unwrap();
    trie.subscribe(&ssid(1, "sensors/#"), Arc::new(Sink(n + 2))).unwrap();
    trie.subscribe(&ssid(1, "$share/g/sensors/+/temp"), Arc::new(Sink(n + 3))).unwrap();
    trie
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie_lookup");
    for n in [1_000u64, 100_000] {
        let trie = populated(MatchStrategy::Emitter, n);
        let query = ssid(1, "sensors/42/temp");
        group.bench_with_input(BenchmarkId::from_parameter(n), &query, |b, query| {
            b.iter(|| black_box(trie.lookup(black_box(query), None).len()))
        });
    }
    group.finish();
}

fn bench_subscribe_unsubscribe(c: &mut Criterion) {
    let trie = populated(MatchStrategy::Emitter, 10_000);
    let query = ssid(1, "bench/a/b/c");
    let sub: Arc<dyn Subscriber> = Arc::new(Sink(u64::MAX));
    let key = sub.key();

    c.bench_function("trie_subscribe_unsubscribe", |b| {
        b.iter(|| {
            trie.subscribe(&query, sub.clone()).unwrap();
            trie.unsubscribe(&query, &key);
        })
    });
}

fn bench_channel_parse(c: &mut Criterion) {
    let channel = b"kVdcSYvmUsN1WAj6L9G-nUBbmY9UmgCa/sensors/building-1/floor-3/temp/?ttl=30&last=10";
    c.bench_function("channel_parse", |b| {
        b.iter(|| black_box(Channel::parse(black_box(channel))))
    });
}

criterion_group!(benches, bench_lookup, bench_subscribe_unsubscribe, bench_channel_parse);
criterion_main!(benches);
