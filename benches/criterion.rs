// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const NUM_WORKERS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[usize] = &[100, 1_000, 10_000];

/// Number of rounds of the task. Large enough for the task to dominate the
/// cost of sending its output back.
const ROUNDS: u64 = 10_000;

/// A CPU-bound task with a small output.
fn collatz_steps(x: u64) -> u64 {
    let mut steps = 0;
    for seed in x..x + ROUNDS {
        let mut n = seed.max(1);
        while n != 1 {
            n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
            steps += 1;
        }
    }
    steps
}

fn collatz(c: &mut Criterion) {
    let mut group = c.benchmark_group("collatz");
    group.sample_size(10);
    for len in LENGTHS {
        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("serial", len), len, serial::collatz);
        for &num_workers in NUM_WORKERS {
            group.bench_with_input(
                BenchmarkId::new(format!("forkpool@{num_workers}"), len),
                len,
                |bencher, len| forkpool::collatz(bencher, num_workers, len),
            );
            group.bench_with_input(
                BenchmarkId::new(format!("forkpool_stream@{num_workers}"), len),
                len,
                |bencher, len| forkpool::collatz_stream(bencher, num_workers, len),
            );
        }
    }
    group.finish();
}

/// Baseline benchmarks on the calling thread, without any worker process
/// involved.
mod serial {
    use criterion::{black_box, Bencher};

    pub fn collatz(bencher: &mut Bencher, len: &usize) {
        bencher.iter(|| {
            (0..*len as u64)
                .map(|x| super::collatz_steps(black_box(x)))
                .collect::<Vec<u64>>()
        });
    }
}

/// Benchmarks using worker processes.
mod forkpool {
    use criterion::{black_box, Bencher};
    use forkpool::{Direct, EngineBuilder, NoProgress, WorkerCount};

    pub fn collatz(bencher: &mut Bencher, num_workers: usize, len: &usize) {
        let mut engine = EngineBuilder {
            workers: WorkerCount::try_from(num_workers).unwrap(),
            ..Default::default()
        }
        .build(NoProgress);
        let task = Direct(|x: u64| Ok::<_, String>(super::collatz_steps(x)));

        bencher.iter(|| {
            engine
                .parallelize(&task, black_box((0..*len as u64).map(|x| (x,)).collect()))
                .unwrap()
        });
    }

    pub fn collatz_stream(bencher: &mut Bencher, num_workers: usize, len: &usize) {
        let mut engine = EngineBuilder {
            workers: WorkerCount::try_from(num_workers).unwrap(),
            ..Default::default()
        }
        .build(NoProgress);
        let task = Direct(|x: u64| Ok::<_, String>(super::collatz_steps(x)));

        bencher.iter(|| {
            engine
                .parallelize_stream(&task, black_box(0..*len as u64))
                .unwrap()
        });
    }
}

criterion_group!(benches, collatz);
criterion_main!(benches);
