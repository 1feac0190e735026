//! Substrate benchmarks using criterion.
//!
//! Run with: cargo bench --bench flow_bench

use std::io::Write;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use batchflow_core::{AcceleratorBackend, ChannelOrder, LoadRequest, RawImage};
use batchflow_device::{BufferPool, BufferRole, HostBackend};
use batchflow_preprocess::{letterbox, pack_batch, PackLayout};
use batchflow_queue::{BoundedQueue, QueueEnd};

const ITEMS: u64 = 10_000;

fn bench_queue_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_handoff");
    group.throughput(Throughput::Elements(ITEMS));

    for &capacity in &[1usize, 16, 320] {
        group.bench_with_input(BenchmarkId::new("spsc", capacity), &capacity, |b, &cap| {
            b.iter(|| {
                let queue = Arc::new(BoundedQueue::new(cap));
                let producer = {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..ITEMS {
                            queue.push(i, QueueEnd::Tail).unwrap();
                        }
                    })
                };
                let mut sum = 0u64;
                for _ in 0..ITEMS {
                    sum += queue.pop(QueueEnd::Head).unwrap();
                }
                producer.join().unwrap();
                std::hint::black_box(sum);
            });
        });
    }
    group.finish();
}

fn bench_pool_cycle(c: &mut Criterion) {
    let mut model = tempfile::NamedTempFile::new().unwrap();
    write!(
        model,
        r#"{{"functions":{{"fusion_0":{{"inputs":[{{"n":1,"c":3,"h":8,"w":8}}],"outputs":[{{"n":1,"c":1,"h":8,"w":1}}]}}}}}}"#
    )
    .unwrap();
    let accel = HostBackend::new()
        .load(&LoadRequest {
            model_path: model.path().to_path_buf(),
            function_name: "fusion_0".into(),
            device_id: 0,
            data_parallelism: 1,
        })
        .unwrap();

    let mut group = c.benchmark_group("pool_cycle");
    for &threads in &[1usize, 4] {
        let pool = Arc::new(BufferPool::new(Arc::clone(&accel), BufferRole::Input, 33, vec![4096]).unwrap());
        group.bench_with_input(BenchmarkId::new("lease_release", threads), &threads, |b, &n| {
            b.iter(|| {
                let workers: Vec<_> = (0..n)
                    .map(|_| {
                        let pool = Arc::clone(&pool);
                        thread::spawn(move || {
                            for _ in 0..1_000 {
                                let set = pool.lease().unwrap();
                                std::hint::black_box(set.slot());
                            }
                        })
                    })
                    .collect();
                for w in workers {
                    w.join().unwrap();
                }
            });
        });
        pool.destroy().unwrap();
    }
    group.finish();
}

fn bench_letterbox_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("letterbox_pack");
    let layout = PackLayout {
        slots: 4,
        height: 500,
        width: 500,
        channels: 3,
        order: ChannelOrder::Bgr,
    };

    for &(w, h) in &[(640u32, 480u32), (1920, 1080)] {
        let src = RawImage {
            data: vec![128; (w * h * 3) as usize],
            width: w,
            height: h,
            channels: 3,
        };
        group.bench_with_input(BenchmarkId::from_parameter(format!("{w}x{h}")), &src, |b, src| {
            b.iter(|| {
                let (img, ratio) = letterbox(src, layout.width, layout.height).unwrap();
                let packed = pack_batch(std::slice::from_ref(&img), &layout).unwrap();
                std::hint::black_box((packed, ratio));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queue_handoff, bench_pool_cycle, bench_letterbox_pack);
criterion_main!(benches);
