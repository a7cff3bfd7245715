// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Callables applied by the workers, and the per-chunk task loop.

use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A callable applied to argument tuples.
///
/// This is implemented for every closure or function taking between 1 and 6
/// arguments and returning a [`Result`], with `Args` the tuple of its
/// argument types: calling it unpacks the tuple positionally.
pub trait TaskFn<Args> {
    /// Output of a successful call.
    type Output;
    /// Error of a failed call.
    type Error: Display;

    /// Applies this callable to one argument tuple.
    fn call(&mut self, args: Args) -> Result<Self::Output, Self::Error>;
}

macro_rules! impl_task_fn {
    ( $( $arg:ident : $ty:ident ),+ ) => {
        impl<Func, $( $ty, )+ Out, Err> TaskFn<( $( $ty, )+ )> for Func
        where
            Func: FnMut( $( $ty ),+ ) -> Result<Out, Err>,
            Err: Display,
        {
            type Output = Out;
            type Error = Err;

            fn call(&mut self, ( $( $arg, )+ ): ( $( $ty, )+ )) -> Result<Out, Err> {
                self( $( $arg ),+ )
            }
        }
    };
}

impl_task_fn!(a: A);
impl_task_fn!(a: A, b: B);
impl_task_fn!(a: A, b: B, c: C);
impl_task_fn!(a: A, b: B, c: C, d: D);
impl_task_fn!(a: A, b: B, c: C, d: D, e: E);
impl_task_fn!(a: A, b: B, c: C, d: D, e: E, f: F);

/// What a worker runs: produces the callable that the worker applies to every
/// argument tuple of its share of the input.
///
/// [`instantiate()`](Self::instantiate) is called exactly once in each worker
/// process, before the first task.
pub trait Executor<Args> {
    /// Callable applied to each argument tuple.
    type Task: TaskFn<Args>;

    /// Creates the callable of one worker.
    fn instantiate(&self) -> Self::Task;
}

/// Output type of the tasks run by an executor.
pub type TaskOutput<E, Args> = <<E as Executor<Args>>::Task as TaskFn<Args>>::Output;

/// A plain function, applied as-is to every argument tuple.
///
/// ```
/// # use forkpool::{Direct, EngineBuilder, NoProgress, WorkerCount};
/// let mut engine = EngineBuilder {
///     workers: WorkerCount::try_from(2).unwrap(),
///     ..Default::default()
/// }
/// .build(NoProgress);
///
/// let sums = engine
///     .parallelize(
///         &Direct(|a: u32, b: u32| Ok::<_, String>(a + b)),
///         vec![(1, 2), (3, 4), (5, 6)],
///     )
///     .unwrap();
/// assert_eq!(sums, [3, 7, 11]);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Direct<F>(pub F);

impl<Args, F: TaskFn<Args> + Clone> Executor<Args> for Direct<F> {
    type Task = F;

    fn instantiate(&self) -> F {
        self.0.clone()
    }
}

/// A zero-argument factory, invoked once per worker to create a stateful
/// callable. This amortizes an expensive setup (loading a model, opening a
/// connection) over all the tasks of a worker.
///
/// ```
/// # use forkpool::{EngineBuilder, Factory, NoProgress, WorkerCount};
/// let mut engine = EngineBuilder {
///     workers: WorkerCount::try_from(2).unwrap(),
///     ..Default::default()
/// }
/// .build(NoProgress);
///
/// // Each worker numbers the tasks it runs, starting from 1.
/// let factory = Factory(|| {
///     let mut seen = 0;
///     move |x: u64| {
///         seen += 1;
///         Ok::<_, String>((x, seen))
///     }
/// });
/// let numbered = engine
///     .parallelize(&factory, vec![(10,), (20,), (30,), (40,)])
///     .unwrap();
/// assert_eq!(numbered, [(10, 1), (20, 2), (30, 1), (40, 2)]);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Factory<M>(pub M);

impl<Args, M, T> Executor<Args> for Factory<M>
where
    M: Fn() -> T,
    T: TaskFn<Args>,
{
    type Task = T;

    fn instantiate(&self) -> T {
        (self.0)()
    }
}

/// Failure of a worker's chunk of tasks.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ChunkFailure {
    /// Position of the failing task in the chunk, or `None` if the executor
    /// failed to instantiate.
    pub position: Option<usize>,
    /// Rendered error or panic message.
    pub message: String,
}

/// A worker's callable, after instantiation.
pub(crate) struct Worker<T> {
    task: T,
}

impl<T> Worker<T> {
    /// Instantiates the executor, turning a panic of the factory into a
    /// failure.
    pub(crate) fn new<Args, E>(executor: &E) -> Result<Self, ChunkFailure>
    where
        E: Executor<Args, Task = T>,
    {
        let instantiated = catch_unwind(AssertUnwindSafe(|| executor.instantiate()));
        let task = instantiated.map_err(|payload| ChunkFailure {
            position: None,
            message: panic_message(payload),
        })?;
        Ok(Self { task })
    }

    /// Applies the callable to one argument tuple, turning an error or a panic
    /// into the failure message.
    pub(crate) fn apply<Args>(&mut self, args: Args) -> Result<T::Output, String>
    where
        T: TaskFn<Args>,
    {
        match catch_unwind(AssertUnwindSafe(|| self.task.call(args))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(panic_message(payload)),
        }
    }
}

/// Runs a chunk of tasks in order, calling `emit` after each completed task.
///
/// Stops at the first failure: no output is returned for the chunk and no
/// further event is emitted. A failure of `emit` also stops the chunk, as the
/// controller is then gone.
pub(crate) fn run_chunk<Args, E, EmitErr>(
    executor: &E,
    chunk: Vec<Args>,
    mut emit: impl FnMut() -> Result<(), EmitErr>,
) -> Result<Vec<TaskOutput<E, Args>>, ChunkFailure>
where
    E: Executor<Args>,
    EmitErr: Display,
{
    let mut worker = Worker::new::<Args, E>(executor)?;
    let mut outputs = Vec::with_capacity(chunk.len());
    for (position, args) in chunk.into_iter().enumerate() {
        let output = worker.apply(args).map_err(|message| ChunkFailure {
            position: Some(position),
            message,
        })?;
        outputs.push(output);
        emit().map_err(|e| ChunkFailure {
            position: Some(position),
            message: format!("failed to report progress: {e}"),
        })?;
    }
    Ok(outputs)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}
