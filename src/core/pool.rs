// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A pool of worker processes, each running the tasks of one chunk.

use super::channel::{ProgressEvent, ProgressSink};
use super::process::{self, ChildPipes, WorkerReader, WorkerSet};
use super::wire::{self, Frame};
use crate::error::Error;
use crate::executor::{self, ChunkFailure, Executor, TaskOutput};
use crate::macros::{log_debug, log_error};
use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::Scope;

/// Outcome of a pool run: the outputs of each chunk, in chunk order.
pub(crate) type PoolOutcome<R> = Result<Vec<Vec<R>>, Error>;

/// A pool spawning one worker process per chunk.
pub(crate) struct WorkerPool {
    num_workers: NonZeroUsize,
}

impl WorkerPool {
    pub(crate) fn new(num_workers: NonZeroUsize) -> Self {
        Self { num_workers }
    }

    /// Forks one worker per chunk and starts collecting their reports on
    /// threads of the given scope.
    ///
    /// Each completed task is forwarded as a
    /// [`CompletedOne`](ProgressEvent::CompletedOne) event to the progress
    /// sink. Once all the chunks have been returned, an
    /// [`AllChunksDone`](ProgressEvent::AllChunksDone) event is sent and the
    /// outputs become available on the returned [`PoolRun`]. As soon as one
    /// worker fails, all the others are killed.
    pub(crate) fn execute<'scope, 'env, Args, E>(
        &self,
        scope: &'scope Scope<'scope, 'env>,
        executor: &E,
        chunks: Vec<Vec<Args>>,
        progress: ProgressSink,
    ) -> Result<PoolRun<TaskOutput<E, Args>>, Error>
    where
        E: Executor<Args>,
        TaskOutput<E, Args>: Serialize + DeserializeOwned + Send + 'scope,
    {
        assert_eq!(chunks.len(), self.num_workers.get());

        let mut processes = Vec::with_capacity(chunks.len());
        let mut readers = Vec::with_capacity(chunks.len());
        let mut offset = 0;
        for (id, chunk) in chunks.into_iter().enumerate() {
            let len = chunk.len();
            let (process, pipes) = process::spawn(id, move |child| {
                run_worker::<Args, E>(executor, chunk, child)
            })?;
            processes.push(process);
            // Chunk workers don't take any input: the chunk was copied with the
            // address space of the worker.
            readers.push((id, offset, pipes.from_worker));
            offset += len;
        }
        let workers = Arc::new(WorkerSet::new(processes));
        log_debug!("Spawned {} chunk workers", self.num_workers);

        let (report_sender, report_receiver) = crossbeam_channel::bounded(readers.len());
        for (id, offset, from_worker) in readers {
            let report_sender = report_sender.clone();
            let progress = progress.clone();
            let workers = workers.clone();
            scope.spawn(move || {
                let from_worker = WorkerReader::new(from_worker, &workers);
                let report = collect_chunk(id, offset, from_worker, &progress);
                if let Err(_e) = &report {
                    log_error!("Worker #{id} failed: {_e}");
                    workers.kill_all();
                }
                let _ = report_sender.send((id, report));
            });
        }
        drop(report_sender);

        let (outcome_sender, outcome) = crossbeam_channel::bounded(1);
        let num_workers = self.num_workers.get();
        scope.spawn(move || supervise(num_workers, report_receiver, progress, outcome_sender));

        Ok(PoolRun { workers, outcome })
    }
}

/// A running pool, whose outcome is delivered on a channel.
///
/// Dropping this kills all the workers that are still running.
pub(crate) struct PoolRun<R> {
    workers: Arc<WorkerSet>,
    outcome: Receiver<PoolOutcome<R>>,
}

impl<R> PoolRun<R> {
    /// Channel on which the outcome is delivered, exactly once.
    pub(crate) fn outcome(&self) -> &Receiver<PoolOutcome<R>> {
        &self.outcome
    }

    /// Waits for the outcome, unless it was already received from
    /// [`outcome()`](Self::outcome), and reaps all the workers.
    pub(crate) fn finish(self, received: Option<PoolOutcome<R>>) -> PoolOutcome<R> {
        let outcome = received.unwrap_or_else(|| {
            self.outcome.recv().unwrap_or_else(|_| {
                Err(Error::Io(std::io::Error::other(
                    "the worker pool stopped without reporting an outcome",
                )))
            })
        });
        if outcome.is_err() {
            self.workers.kill_all();
        }
        self.workers.reap_all();
        outcome
    }

    /// Kills and reaps all the workers.
    pub(crate) fn abort(self) {
        self.workers.kill_all();
        self.workers.reap_all();
    }
}

impl<R> Drop for PoolRun<R> {
    fn drop(&mut self) {
        self.workers.kill_all();
    }
}

/// Body of a worker process: runs the chunk and reports on the output pipe.
fn run_worker<Args, E>(executor: &E, chunk: Vec<Args>, child: ChildPipes) -> bool
where
    E: Executor<Args>,
    TaskOutput<E, Args>: Serialize,
{
    let ChildPipes { input, mut output } = child;
    drop(input);

    let frame = executor::run_chunk(executor, chunk, || Frame::Progress.write_to(&mut output))
        .and_then(|outputs| encode_outputs(&outputs))
        .map_or_else(Frame::from, Frame::Output);
    let success = matches!(frame, Frame::Output(_));
    frame.write_to(&mut output).is_ok() && success
}

/// Encodes the outputs of a chunk as a sequence that decodes into a `Vec`,
/// identifying the output that failed to encode if any.
fn encode_outputs<R: Serialize>(outputs: &[R]) -> Result<Vec<u8>, ChunkFailure> {
    // Same as `bincode::serialize()` of a slice: a little-endian `u64` length
    // followed by the elements.
    let mut payload = (outputs.len() as u64).to_le_bytes().to_vec();
    for (position, output) in outputs.iter().enumerate() {
        bincode::serialize_into(&mut payload, output).map_err(|e| ChunkFailure {
            position: Some(position),
            message: format!("failed to encode the output: {e}"),
        })?;
    }
    Ok(payload)
}

/// Reads the reports of one chunk worker until its terminal frame.
fn collect_chunk<R: DeserializeOwned>(
    id: usize,
    offset: usize,
    from_worker: WorkerReader<'_>,
    progress: &ProgressSink,
) -> Result<Vec<R>, Error> {
    let mut reader = BufReader::new(from_worker);
    loop {
        match wire::expect_frame(id, &mut reader)? {
            Frame::Progress => progress.emit(ProgressEvent::CompletedOne),
            Frame::Output(payload) => return Ok(Frame::decode(&payload)?),
            Frame::Failure { position, message } => {
                return Err(Error::Task {
                    chunk: id,
                    index: position.map(|p| offset.saturating_add(wire::to_index(p))),
                    message,
                })
            }
            frame => return Err(wire::unexpected_frame(id, &frame)),
        }
    }
}

/// Gathers the reports of all the chunk workers into the pool outcome.
fn supervise<R>(
    num_workers: usize,
    reports: Receiver<(usize, Result<Vec<R>, Error>)>,
    progress: ProgressSink,
    outcome: Sender<PoolOutcome<R>>,
) {
    let mut chunks: Vec<Option<Vec<R>>> = (0..num_workers).map(|_| None).collect();
    let mut failure: Option<Error> = None;
    for (id, report) in reports.iter() {
        match report {
            Ok(outputs) => chunks[id] = Some(outputs),
            Err(e) => {
                failure = Some(match failure {
                    None => e,
                    Some(previous) => previous.originating(e),
                })
            }
        }
    }

    let result = match failure {
        Some(e) => Err(e),
        None => chunks
            .into_iter()
            .enumerate()
            .map(|(id, chunk)| chunk.ok_or(Error::WorkerLost { worker: id }))
            .collect(),
    };
    if result.is_ok() {
        progress.emit(ProgressEvent::AllChunksDone);
    }
    let _ = outcome.send(result);
}
