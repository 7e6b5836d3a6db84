// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use strand::{Strand, StrandStack};

fn strand_switch(c: &mut Criterion) {
    let stack = StrandStack::default();
    let mut identity = Strand::new(stack, |mut input: usize, yielder| {
        loop {
            input = yielder.suspend(input);
        }
    });

    c.bench_function("strand_switch", |b| {
        b.iter(|| identity.resume(black_box(0usize)))
    });

    // The identity strand never returns; it is leaked (not unmapped) on drop.
}

fn strand_rebind(c: &mut Criterion) {
    // Measures the reuse fast path: rebinding a finished strand and running
    // it to completion, without any stack allocation.
    let stack = StrandStack::default();
    let mut strand = Strand::<usize, (), usize>::new(stack, |input, _| input);
    strand.resume(0);

    c.bench_function("strand_rebind_and_call", |b| {
        b.iter(|| {
            strand.rebind(|input, _| input);
            strand.resume(black_box(0usize))
        })
    });
}

criterion_group!(benches, strand_switch, strand_rebind);
criterion_main!(benches);
