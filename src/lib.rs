// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]

mod config;
mod core;
mod engine;
mod error;
mod executor;
mod macros;
mod progress;

pub use config::{EngineBuilder, WorkerCount, DEFAULT_STALL_TIMEOUT};
pub use engine::Engine;
pub use error::Error;
pub use executor::{Direct, Executor, Factory, TaskFn, TaskOutput};
pub use progress::{ConsoleProgress, NoProgress, ProgressReporter};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Applies the executor to every argument tuple on all cores but one, with a
/// progress bar on the standard error and the default stall timeout.
///
/// See [`Engine::parallelize()`].
pub fn parallelize<Args, E>(
    executor: &E,
    args_set: Vec<Args>,
) -> Result<Vec<TaskOutput<E, Args>>, Error>
where
    E: Executor<Args>,
    TaskOutput<E, Args>: Serialize + DeserializeOwned + Send,
{
    EngineBuilder::default()
        .build(ConsoleProgress::stderr())
        .parallelize(executor, args_set)
}

/// Applies the executor to every item of the sequence on all cores but one.
///
/// See [`Engine::parallelize_stream()`].
pub fn parallelize_stream<T, E>(
    executor: &E,
    stream: impl IntoIterator<Item = T>,
) -> Result<Vec<TaskOutput<E, (T,)>>, Error>
where
    T: Serialize + DeserializeOwned,
    E: Executor<(T,)>,
    TaskOutput<E, (T,)>: Serialize + DeserializeOwned + Send,
{
    EngineBuilder::default()
        .build(ConsoleProgress::stderr())
        .parallelize_stream(executor, stream)
}
