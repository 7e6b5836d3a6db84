// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use weft::{Config, Scheduler};

fn spawn_join(c: &mut Criterion) {
    let sched = Scheduler::with_config(Config::default().workers(2).stack_size(64 * 1024));
    sched.prewarm(16).unwrap();

    c.bench_function("spawn_join", |b| {
        b.iter(|| {
            let handle = sched.spawn(|| black_box(41_u64) + 1);
            handle.join().unwrap()
        })
    });

    sched.shutdown();
}

fn spawn_burst_64(c: &mut Criterion) {
    let sched = Scheduler::with_config(Config::default().workers(4).stack_size(64 * 1024));
    sched.prewarm(64).unwrap();

    c.bench_function("spawn_burst_64", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..64)
                .map(|i| sched.spawn(move || black_box(i) * 2_u64))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<u64>()
        })
    });

    sched.shutdown();
}

criterion_group!(benches, spawn_join, spawn_burst_64);
criterion_main!(benches);
