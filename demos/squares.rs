// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool squaring integers on worker processes.

use clap::Parser;
use forkpool::{ConsoleProgress, Direct, EngineBuilder, Error, WorkerCount};
use std::time::Duration;

fn main() -> Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut engine = EngineBuilder {
        workers: cli.workers,
        stall_timeout: Duration::from_millis(cli.stall_timeout_ms),
    }
    .build(ConsoleProgress::stderr());

    let delay = Duration::from_millis(cli.delay_ms);
    let square = Direct(|x: u64| {
        std::thread::sleep(delay);
        x.checked_mul(x)
            .ok_or_else(|| format!("{x} squared overflows"))
    });

    let squares = if cli.stream {
        engine.parallelize_stream(&square, 0..cli.count)?
    } else {
        engine.parallelize(&square, (0..cli.count).map(|x| (x,)).collect())?
    };

    let sum: u128 = squares.iter().map(|&x| u128::from(x)).sum();
    println!("sum of {} squares = {sum}", squares.len());
    Ok(())
}

#[derive(Parser, Debug)]
#[command(about = "Squares integers on worker processes")]
struct Cli {
    /// Number of worker processes: a positive count, or a non-positive offset
    /// to the available parallelism. Default to all cores but one.
    #[arg(long, default_value = "auto", allow_negative_numbers = true)]
    workers: WorkerCount,

    /// Abort if no task completes for this many milliseconds.
    #[arg(long, default_value_t = 10_000)]
    stall_timeout_ms: u64,

    /// Number of integers to square.
    #[arg(long, default_value_t = 1_000)]
    count: u64,

    /// Delay of each task, in milliseconds.
    #[arg(long, default_value_t = 1)]
    delay_ms: u64,

    /// Whether to feed the integers as a lazy stream rather than a list.
    #[arg(long, default_value_t = false)]
    stream: bool,
}
