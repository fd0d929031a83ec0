//! Hot-path microbenchmarks: ring cursor traffic and frame custody moves.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use wirebed_io::{FramePool, RingChannel};

fn ring_batch_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for batch in [1u32, 16, 64] {
        group.bench_function(format!("produce_consume_{batch}"), |b| {
            // one handle plays both roles; the cursor words and barriers
            // are exactly the cross-thread ones
            let mut ring = RingChannel::<u64>::heap(4096).unwrap();
            b.iter(|| {
                let (start, granted) = ring.reserve(batch);
                ring.commit_writes(start, granted, u64::from);
                let (cur, avail) = ring.peek(batch);
                let mut sum = 0u64;
                for i in 0..avail {
                    sum += ring.entry(cur.wrapping_add(i));
                }
                ring.release(avail).unwrap();
                black_box(sum)
            });
        });
    }
    group.finish();
}

fn frame_custody_cycle(c: &mut Criterion) {
    c.bench_function("pool/rx_path", |b| {
        let mut pool = FramePool::create(64, 2048).unwrap();
        let offsets: Vec<_> = pool.all_offsets().collect();
        for off in &offsets {
            pool.submit_to_fill(*off).unwrap();
        }
        b.iter(|| {
            for off in &offsets {
                pool.receive(*off).unwrap();
                pool.deliver(*off).unwrap();
                pool.submit_to_fill(*off).unwrap();
            }
            black_box(pool.state_counts().in_fill)
        });
    });
}

criterion_group!(benches, ring_batch_cycle, frame_custody_cycle);
criterion_main!(benches);
