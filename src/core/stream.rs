// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ordered map of a lazy sequence over worker processes.
//!
//! Items are dealt to the workers in turn: item `i` goes to worker
//! `i % num_workers`. Each worker processes its items in the order it receives
//! them, so the output of item `i` is the `i / num_workers`-th output of its
//! worker.

use super::process::{self, ChildPipes, WorkerReader, WorkerSet};
use super::wire::{self, Frame};
use crate::error::Error;
use crate::executor::{ChunkFailure, Executor, TaskOutput, Worker};
use crate::macros::{log_debug, log_error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::num::NonZeroUsize;

/// Applies the executor to every item of the sequence on `num_workers` worker
/// processes, and returns the outputs in sequence order.
///
/// The sequence is consumed on the calling thread, at the pace at which the
/// workers process it.
pub(crate) fn ordered_map<Args, E>(
    num_workers: NonZeroUsize,
    executor: &E,
    items: impl Iterator<Item = Args>,
) -> Result<Vec<TaskOutput<E, Args>>, Error>
where
    Args: Serialize + DeserializeOwned,
    E: Executor<Args>,
    TaskOutput<E, Args>: Serialize + DeserializeOwned + Send,
{
    let num_workers = num_workers.get();
    let mut processes = Vec::with_capacity(num_workers);
    let mut inputs = Vec::with_capacity(num_workers);
    let mut outputs = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let (process, pipes) = process::spawn(id, |child| serve::<Args, E>(executor, child))?;
        processes.push(process);
        inputs.push(pipes.to_worker);
        outputs.push(pipes.from_worker);
    }
    let workers = WorkerSet::new(processes);
    log_debug!("Spawned {num_workers} stream workers");

    let (dispatched, reports) = std::thread::scope(|s| {
        let collectors: Vec<_> = outputs
            .into_iter()
            .enumerate()
            .map(|(id, from_worker)| {
                let workers = &workers;
                s.spawn(move || {
                    let from_worker = WorkerReader::new(from_worker, workers);
                    let report = collect::<TaskOutput<E, Args>>(id, num_workers, from_worker);
                    if let Err(_e) = &report {
                        log_error!("Worker #{id} failed: {_e}");
                        workers.kill_all();
                    }
                    report
                })
            })
            .collect();

        let dispatched = dispatch(items, &mut inputs, &workers);
        if dispatched.is_err() {
            workers.kill_all();
        }
        drop(inputs);

        let reports: Vec<_> = collectors
            .into_iter()
            .map(|collector| {
                collector.join().unwrap_or_else(|_| {
                    Err(Error::Io(std::io::Error::other(
                        "a worker reader thread panicked",
                    )))
                })
            })
            .collect();
        (dispatched, reports)
    });

    let result = reassemble(dispatched, reports, num_workers);
    if result.is_err() {
        workers.kill_all();
    }
    workers.reap_all();
    result
}

/// Deals the items to the workers, then tells each worker that the input is
/// over. Returns the number of items dealt.
fn dispatch<Args: Serialize>(
    items: impl Iterator<Item = Args>,
    inputs: &mut [File],
    workers: &WorkerSet,
) -> Result<usize, Error> {
    let num_workers = inputs.len();
    let mut count = 0;
    for (i, item) in items.enumerate() {
        if workers.is_aborted() {
            break;
        }
        Frame::input(&item)?.write_to(&mut inputs[i % num_workers])?;
        count = i + 1;
    }
    for input in inputs.iter_mut() {
        Frame::End.write_to(input)?;
    }
    Ok(count)
}

/// Interleaves the per-worker outputs back into sequence order, or picks the
/// error closest to the root cause.
fn reassemble<R>(
    dispatched: Result<usize, Error>,
    reports: Vec<Result<Vec<R>, Error>>,
    num_workers: usize,
) -> Result<Vec<R>, Error> {
    let (count, mut error) = match dispatched {
        Ok(count) => (count, None),
        Err(e) => (0, Some(e)),
    };
    let mut per_worker = Vec::with_capacity(num_workers);
    for report in reports {
        match report {
            Ok(outputs) => per_worker.push(outputs.into_iter()),
            Err(e) => {
                error = Some(match error.take() {
                    None => e,
                    Some(previous) => previous.originating(e),
                })
            }
        }
    }
    if let Some(e) = error {
        return Err(e);
    }

    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let worker = i % num_workers;
        results.push(
            per_worker[worker]
                .next()
                .ok_or(Error::WorkerLost { worker })?,
        );
    }
    if let Some(worker) = per_worker
        .iter()
        .position(|outputs| !outputs.as_slice().is_empty())
    {
        return Err(wire::unexpected_frame(worker, &Frame::Output(Vec::new())));
    }
    Ok(results)
}

/// Body of a stream worker process: processes input frames until the end of
/// the input.
fn serve<Args, E>(executor: &E, child: ChildPipes) -> bool
where
    Args: DeserializeOwned,
    E: Executor<Args>,
    TaskOutput<E, Args>: Serialize,
{
    let ChildPipes { input, mut output } = child;
    let mut input = BufReader::new(input);

    let mut worker = match Worker::new::<Args, E>(executor) {
        Ok(worker) => worker,
        Err(failure) => {
            let _ = Frame::from(failure).write_to(&mut output);
            return false;
        }
    };

    let mut position = 0;
    loop {
        let payload = match Frame::read_from(&mut input) {
            Ok(Some(Frame::Input(payload))) => payload,
            Ok(Some(Frame::End)) => return Frame::Finished.write_to(&mut output).is_ok(),
            // The controller is gone or confused.
            _ => return false,
        };
        let reply = Frame::decode::<Args>(&payload)
            .map_err(|e| format!("failed to decode the arguments: {e}"))
            .and_then(|args| worker.apply(args))
            .and_then(|out| {
                Frame::output(&out).map_err(|e| format!("failed to encode the output: {e}"))
            });
        match reply {
            Ok(frame) => {
                if frame.write_to(&mut output).is_err() {
                    return false;
                }
            }
            Err(message) => {
                let failure = ChunkFailure {
                    position: Some(position),
                    message,
                };
                let _ = Frame::from(failure).write_to(&mut output);
                return false;
            }
        }
        position += 1;
    }
}

/// Reads the outputs of one stream worker until it finishes.
fn collect<R: DeserializeOwned>(
    id: usize,
    num_workers: usize,
    from_worker: WorkerReader<'_>,
) -> Result<Vec<R>, Error> {
    let mut reader = BufReader::new(from_worker);
    let mut outputs = Vec::new();
    loop {
        match wire::expect_frame(id, &mut reader)? {
            Frame::Output(payload) => outputs.push(Frame::decode(&payload)?),
            Frame::Finished => return Ok(outputs),
            Frame::Failure { position, message } => {
                return Err(Error::Task {
                    chunk: id,
                    index: position.map(|p| {
                        wire::to_index(p)
                            .saturating_mul(num_workers)
                            .saturating_add(id)
                    }),
                    message,
                })
            }
            frame => return Err(wire::unexpected_frame(id, &frame)),
        }
    }
}
