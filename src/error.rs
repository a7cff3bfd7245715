// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors returned by the engine.

use std::time::Duration;

/// Failure of a whole [`parallelize`](crate::Engine::parallelize) or
/// [`parallelize_stream`](crate::Engine::parallelize_stream) call.
///
/// A call either returns every output in input order, or one of these. There
/// is no partial result: by the time an error is returned, every worker
/// process spawned for the call has been terminated and reaped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The worker count directive doesn't resolve to at least one worker.
    #[error("invalid worker configuration: {0}")]
    Configuration(String),

    /// A task callable returned an error or panicked.
    #[error(
        "{} in chunk {chunk} failed: {message}",
        .index.map_or_else(|| "worker setup".to_owned(), |i| format!("task #{i}"))
    )]
    Task {
        /// Worker (and chunk) where the failure happened.
        chunk: usize,
        /// Index in the input sequence of the argument tuple that failed, or
        /// `None` if the per-worker factory itself failed.
        index: Option<usize>,
        /// Rendered error or panic message.
        message: String,
    },

    /// No progress event arrived within the configured window. This usually
    /// means that a worker hung or ran out of memory.
    #[error("no progress for {timeout:?} after {completed}/{total} tasks, aborted all workers")]
    StallTimeout {
        /// The configured stall timeout.
        timeout: Duration,
        /// Number of tasks completed before the stall.
        completed: usize,
        /// Total number of tasks in the call.
        total: usize,
    },

    /// A worker process died without reporting a result or a failure, for
    /// example because it was killed by a signal.
    #[error("worker {worker} exited without reporting a result")]
    WorkerLost {
        /// Index of the worker that was lost.
        worker: usize,
    },

    /// Creating a worker process or its pipes failed.
    #[error("failed to spawn a worker process: {0}")]
    Spawn(#[source] nix::Error),

    /// Reading from or writing to a worker pipe failed.
    #[error("i/o error on a worker pipe: {0}")]
    Io(#[from] std::io::Error),

    /// An output or stream item could not be encoded or decoded.
    #[error("failed to encode or decode a value: {0}")]
    Codec(#[from] bincode::Error),
}

impl Error {
    /// Of two errors collected while tearing down a failed call, keeps the
    /// one closest to the root cause.
    ///
    /// Once a worker fails all the others are killed, so their own reports
    /// are lost workers: a task failure always wins over these.
    pub(crate) fn originating(self, other: Error) -> Error {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Error::Task { .. } => 0,
            Error::Configuration(_)
            | Error::StallTimeout { .. }
            | Error::Spawn(_)
            | Error::Codec(_) => 1,
            Error::WorkerLost { .. } => 2,
            Error::Io(_) => 3,
        }
    }
}
