use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use paymentjob_core::RetryPolicy;
use paymentjob_worker::queue::InMemoryQueue;
use paymentjob_worker::storage::InMemoryRecordStore;
use paymentjob_worker::{
    ConnectionManager, Connector, MessageQueue, QueueError, RecordStore, RunLoop, RunSettings,
    StorageError,
};

#[derive(Clone)]
struct PreloadedServices {
    store: Arc<InMemoryRecordStore>,
    queue: InMemoryQueue,
}

#[async_trait]
impl Connector for PreloadedServices {
    async fn connect_storage(&self) -> Result<Box<dyn RecordStore>, StorageError> {
        Ok(Box::new(self.store.clone()))
    }

    async fn connect_queue(&self) -> Result<Box<dyn MessageQueue>, QueueError> {
        Ok(Box::new(self.queue.clone()))
    }
}

fn preload(messages: u64) -> PreloadedServices {
    let queue = InMemoryQueue::new().with_block(Duration::from_millis(1));
    for n in 0..messages {
        let body = format!(r#"{{"payment_id": {n}, "amount": "19.99", "currency": "EUR"}}"#);
        queue.publish(body, Some(&format!("m-{n}")));
    }
    PreloadedServices {
        store: Arc::new(InMemoryRecordStore::new()),
        queue,
    }
}

fn bench_drain_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("drain_throughput");
    for messages in [10_u64, 100, 1_000] {
        group.throughput(Throughput::Elements(messages));
        group.bench_with_input(BenchmarkId::from_parameter(messages), &messages, |b, &n| {
            b.iter(|| {
                let services = preload(n);
                let run_loop = RunLoop::new(
                    ConnectionManager::new(services.clone(), RetryPolicy::no_retry()),
                    RunSettings {
                        source_queue: "payments".to_string(),
                        max_messages: Some(n),
                        redelivery_delay: Duration::ZERO,
                    },
                );
                let summary = runtime
                    .block_on(run_loop.run(std::future::pending::<()>()))
                    .unwrap();
                black_box(summary.processed)
            });
        });
    }
    group.finish();
}

fn bench_poison_mix(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    c.bench_function("drain_with_one_in_ten_malformed", |b| {
        b.iter(|| {
            let queue = InMemoryQueue::new().with_block(Duration::from_millis(1));
            for n in 0..100_u64 {
                if n % 10 == 0 {
                    queue.publish("{truncated", None);
                } else {
                    queue.publish(format!(r#"{{"payment_id": {n}}}"#), None);
                }
            }
            let services = PreloadedServices {
                store: Arc::new(InMemoryRecordStore::new()),
                queue,
            };
            let run_loop = RunLoop::new(
                ConnectionManager::new(services, RetryPolicy::no_retry()),
                RunSettings {
                    source_queue: "payments".to_string(),
                    max_messages: Some(100),
                    redelivery_delay: Duration::ZERO,
                },
            );
            let summary = runtime
                .block_on(run_loop.run(std::future::pending::<()>()))
                .unwrap();
            black_box(summary.rejected)
        });
    });
}

criterion_group!(benches, bench_drain_throughput, bench_poison_mix);
criterion_main!(benches);
