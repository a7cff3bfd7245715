// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The engine driving calls from the controlling thread.

use crate::config::WorkerCount;
use crate::core::channel::{progress_channel, ProgressEvent};
use crate::core::partition::partition;
use crate::core::pool::{PoolOutcome, PoolRun, WorkerPool};
use crate::core::stream::ordered_map;
use crate::error::Error;
use crate::executor::{Executor, TaskOutput};
use crate::macros::{log_debug, log_info, log_warn};
use crate::progress::ProgressReporter;
use crossbeam_channel::{select, Receiver};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Runs calls over freshly forked worker processes, reporting progress to a
/// [`ProgressReporter`].
///
/// An engine holds no process between calls: each call spawns its workers,
/// and every one of them has exited by the time the call returns, whether it
/// succeeded or not.
pub struct Engine<P> {
    workers: WorkerCount,
    stall_timeout: Duration,
    reporter: P,
}

impl<P: ProgressReporter> Engine<P> {
    pub(crate) fn new(workers: WorkerCount, stall_timeout: Duration, reporter: P) -> Self {
        Self {
            workers,
            stall_timeout,
            reporter,
        }
    }

    /// Directive resolved into the number of workers of each call.
    pub fn workers(&self) -> WorkerCount {
        self.workers
    }

    /// Maximal delay between two progress events of a
    /// [`parallelize()`](Self::parallelize) call.
    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Returns a reference to the progress reporter.
    pub fn reporter(&self) -> &P {
        &self.reporter
    }

    /// Returns a mutable reference to the progress reporter.
    pub fn reporter_mut(&mut self) -> &mut P {
        &mut self.reporter
    }

    /// Consumes the engine and returns its progress reporter.
    pub fn into_reporter(self) -> P {
        self.reporter
    }

    /// Applies the executor to every argument tuple, and returns the outputs in
    /// input order.
    ///
    /// The input is split into one contiguous chunk per worker process. Each
    /// worker reports every completed task, and the reporter renders the
    /// fraction of completed tasks. If no task completes within the stall
    /// timeout, all the workers are killed and [`Error::StallTimeout`] is
    /// returned.
    ///
    /// The first failing task fails the whole call: the other workers are
    /// killed and no output is returned.
    ///
    /// ```
    /// # use forkpool::{Direct, EngineBuilder, Error, NoProgress, WorkerCount};
    /// let mut engine = EngineBuilder {
    ///     workers: WorkerCount::try_from(2).unwrap(),
    ///     ..Default::default()
    /// }
    /// .build(NoProgress);
    ///
    /// let invert = Direct(|x: i32| {
    ///     if x == 0 {
    ///         Err("division by zero")
    ///     } else {
    ///         Ok(1.0 / x as f64)
    ///     }
    /// });
    /// assert_eq!(engine.parallelize(&invert, vec![(1,), (2,)]).unwrap(), [1.0, 0.5]);
    ///
    /// let err = engine.parallelize(&invert, vec![(1,), (0,), (2,)]).unwrap_err();
    /// assert!(matches!(err, Error::Task { index: Some(1), .. }));
    /// ```
    pub fn parallelize<Args, E>(
        &mut self,
        executor: &E,
        args_set: Vec<Args>,
    ) -> Result<Vec<TaskOutput<E, Args>>, Error>
    where
        E: Executor<Args>,
        TaskOutput<E, Args>: Serialize + DeserializeOwned + Send,
    {
        let num_workers = self.workers.resolve()?;
        let total = args_set.len();
        if total == 0 {
            log_debug!("Empty input, not spawning any worker");
            return Ok(Vec::new());
        }

        self.reporter.announce(num_workers);
        log_info!("Running {total} tasks on {num_workers} worker processes");

        let chunks = partition(args_set, num_workers);
        let (sink, events) = progress_channel();
        let stall_timeout = self.stall_timeout;
        let reporter = &mut self.reporter;

        let chunks = std::thread::scope(|s| {
            let run = WorkerPool::new(num_workers).execute(s, executor, chunks, sink)?;
            reporter.report(0.0);
            drain(reporter, run, &events, total, stall_timeout)
        })?;

        let outputs: Vec<_> = chunks.into_iter().flatten().collect();
        debug_assert_eq!(outputs.len(), total);
        Ok(outputs)
    }

    /// Applies the executor to every item of the sequence, each item being the
    /// sole argument of the task, and returns the outputs in sequence order.
    ///
    /// The sequence is consumed lazily: items are sent to the workers one at a
    /// time. No progress is reported and no stall timeout applies.
    ///
    /// ```
    /// # use forkpool::{Direct, EngineBuilder, NoProgress, WorkerCount};
    /// let mut engine = EngineBuilder {
    ///     workers: WorkerCount::try_from(3).unwrap(),
    ///     ..Default::default()
    /// }
    /// .build(NoProgress);
    ///
    /// let lengths = engine
    ///     .parallelize_stream(
    ///         &Direct(|line: String| Ok::<_, String>(line.len())),
    ///         "a bb ccc dddd".split(' ').map(str::to_owned),
    ///     )
    ///     .unwrap();
    /// assert_eq!(lengths, [1, 2, 3, 4]);
    /// ```
    pub fn parallelize_stream<T, E>(
        &mut self,
        executor: &E,
        stream: impl IntoIterator<Item = T>,
    ) -> Result<Vec<TaskOutput<E, (T,)>>, Error>
    where
        T: Serialize + DeserializeOwned,
        E: Executor<(T,)>,
        TaskOutput<E, (T,)>: Serialize + DeserializeOwned + Send,
    {
        self.parallelize_stream_expanded(executor, stream.into_iter().map(|item| (item,)))
    }

    /// Same as [`parallelize_stream()`](Self::parallelize_stream), but each
    /// item is an argument tuple, unpacked positionally.
    pub fn parallelize_stream_expanded<Args, E>(
        &mut self,
        executor: &E,
        stream: impl IntoIterator<Item = Args>,
    ) -> Result<Vec<TaskOutput<E, Args>>, Error>
    where
        Args: Serialize + DeserializeOwned,
        E: Executor<Args>,
        TaskOutput<E, Args>: Serialize + DeserializeOwned + Send,
    {
        let num_workers = self.workers.resolve()?;
        let mut items = stream.into_iter().peekable();
        if items.peek().is_none() {
            log_debug!("Empty stream, not spawning any worker");
            return Ok(Vec::new());
        }

        self.reporter.announce(num_workers);
        log_info!("Streaming on {num_workers} worker processes");
        ordered_map(num_workers, executor, items)
    }
}

/// Drains the progress events of a running pool until all the chunks are
/// done, the pool fails or no event arrives within the stall timeout.
fn drain<R>(
    reporter: &mut impl ProgressReporter,
    run: PoolRun<R>,
    events: &Receiver<ProgressEvent>,
    total: usize,
    stall_timeout: Duration,
) -> PoolOutcome<R> {
    let outcome = run.outcome().clone();
    let mut completed = 0;

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(ProgressEvent::CompletedOne) => {
                    completed += 1;
                    reporter.report(completed as f64 / total as f64);
                }
                Ok(ProgressEvent::AllChunksDone) => {
                    debug_assert_eq!(completed, total);
                    log_debug!("All {total} tasks completed");
                    return run.finish(None);
                }
                // All the readers stopped without completing the call.
                Err(_) => return run.finish(None),
            },
            recv(outcome) -> received => {
                let received = received.unwrap_or_else(|_| {
                    Err(Error::Io(std::io::Error::other(
                        "the worker pool stopped without reporting an outcome",
                    )))
                });
                if received.is_ok() {
                    // Events sent before the outcome may not have been selected
                    // yet.
                    for event in events.try_iter() {
                        if event == ProgressEvent::CompletedOne {
                            completed += 1;
                            reporter.report(completed as f64 / total as f64);
                        }
                    }
                    debug_assert_eq!(completed, total);
                }
                return run.finish(Some(received));
            },
            default(stall_timeout) => {
                log_warn!(
                    "No progress for {stall_timeout:?} after {completed}/{total} \
                     tasks, aborting"
                );
                run.abort();
                return Err(Error::StallTimeout {
                    timeout: stall_timeout,
                    completed,
                    total,
                });
            },
        }
    }
}
