// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use weft::{Config, Scheduler};

/// Round-trip park/unpark latency between the bench thread and one fiber.
fn park_unpark_ping_pong(c: &mut Criterion) {
    let sched = Scheduler::with_config(Config::default().workers(2).stack_size(64 * 1024));

    let flag = Arc::new(AtomicU32::new(0));
    let stop = Arc::new(AtomicU32::new(0));

    let handle = {
        let flag = Arc::clone(&flag);
        let stop = Arc::clone(&stop);
        sched.spawn(move || {
            while stop.load(Ordering::SeqCst) == 0 {
                flag.store(1, Ordering::SeqCst);
                while flag.load(Ordering::SeqCst) == 1 && stop.load(Ordering::SeqCst) == 0 {
                    weft::park_while(&flag, 1, "bench ping-pong");
                }
            }
        })
    };
    let unparker = handle.unparker();

    c.bench_function("park_unpark_ping_pong", |b| {
        b.iter(|| {
            while flag.load(Ordering::SeqCst) != 1 {
                std::hint::spin_loop();
            }
            flag.store(2, Ordering::SeqCst);
            unparker.unpark();
        })
    });

    stop.store(1, Ordering::SeqCst);
    unparker.unpark();
    handle.join().unwrap();
    sched.shutdown();
}

fn yield_throughput(c: &mut Criterion) {
    let sched = Scheduler::with_config(Config::default().workers(1).stack_size(64 * 1024));

    c.bench_function("yield_1000", |b| {
        b.iter(|| {
            let handle = sched.spawn(|| {
                for _ in 0..1000 {
                    weft::yield_now();
                }
            });
            handle.join().unwrap()
        })
    });

    sched.shutdown();
}

criterion_group!(benches, park_unpark_ping_pong, yield_throughput);
criterion_main!(benches);
