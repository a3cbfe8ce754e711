//! Performance benchmarks for confab-subpub
//!
//! Run with: cargo bench

use confab_subpub::SubPub;
use criterion::{criterion_group, criterion_main, Criterion};
use tokio_util::sync::CancellationToken;

fn bench_publish(c: &mut Criterion) {
    c.bench_function("publish_no_subscribers", |b| {
        let bus: SubPub<u64> = SubPub::new();
        let mut idx = 0i64;
        b.iter(|| {
            idx += 1;
            bus.publish(idx, idx as u64);
        });
    });

    c.bench_function("publish_fanout_8_draining", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| {
            rt.block_on(async {
                let bus: SubPub<u64> = SubPub::new();
                let token = CancellationToken::new();
                let mut subs: Vec<_> = (0..8).map(|_| bus.subscribe(&token, -1)).collect();
                for i in 0..8i64 {
                    bus.publish(i, i as u64);
                    for sub in subs.iter_mut() {
                        sub.next().await;
                    }
                }
            });
        });
    });
}

fn bench_subscribe_churn(c: &mut Criterion) {
    c.bench_function("subscribe_cancel_reap", |b| {
        let bus: SubPub<u64> = SubPub::new();
        let mut idx = 0i64;
        b.iter(|| {
            let token = CancellationToken::new();
            let _sub = bus.subscribe(&token, idx);
            token.cancel();
            idx += 1;
            // Reaps the cancelled subscriber.
            bus.publish(idx, idx as u64);
        });
    });
}

criterion_group!(benches, bench_publish, bench_subscribe_churn);
criterion_main!(benches);
