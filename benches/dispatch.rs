use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use mux_io::queue::{BlockingQueue, TaskQueue};
use mux_io::{PoolConfig, Selector, ThreadPool};

fn bench_queue_offer_poll(c: &mut Criterion) {
    let queue = BlockingQueue::unbounded();
    c.bench_function("queue_offer_poll", |b| {
        b.iter(|| {
            queue
                .offer(Box::new(|| {}))
                .unwrap_or_else(|_| panic!("offer failed"));
            queue.poll_now().unwrap()();
        })
    });
}

fn bench_pool_submit(c: &mut Criterion) {
    let config = PoolConfig::builder()
        .core_size(4)
        .max_size(4)
        .keep_alive(Duration::from_secs(1))
        .build();
    let pool = ThreadPool::new(config, Arc::new(BlockingQueue::unbounded()));
    c.bench_function("pool_submit", |b| {
        b.iter(|| {
            pool.execute(|| {}).unwrap();
        })
    });
    pool.shutdown();
    pool.await_termination(Duration::from_secs(10));
}

fn bench_selector_wakeup_cycle(c: &mut Criterion) {
    let selector = Selector::open().unwrap();
    c.bench_function("selector_wakeup_cycle", |b| {
        b.iter(|| {
            selector.wakeup();
            selector.select(1000).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_queue_offer_poll,
    bench_pool_submit,
    bench_selector_wakeup_cycle
);
criterion_main!(benches);
