// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Engine configuration: number of workers and stall timeout.

use crate::engine::Engine;
use crate::error::Error;
use crate::progress::ProgressReporter;
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

/// Default stall timeout between two progress events.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of worker processes to spawn for a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCount {
    /// Spawn the number of workers returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn as many workers as the available parallelism, minus the given
    /// number.
    AllBut(usize),
    /// Spawn the given number of workers.
    Count(NonZeroUsize),
}

impl WorkerCount {
    /// Interprets an integer directive: a positive value is an absolute count,
    /// zero or a negative value is added to the available parallelism.
    ///
    /// ```
    /// # use forkpool::WorkerCount;
    /// # use std::num::NonZeroUsize;
    /// assert_eq!(
    ///     WorkerCount::from_directive(4),
    ///     WorkerCount::Count(NonZeroUsize::new(4).unwrap())
    /// );
    /// assert_eq!(WorkerCount::from_directive(0), WorkerCount::AvailableParallelism);
    /// assert_eq!(WorkerCount::from_directive(-1), WorkerCount::AllBut(1));
    /// ```
    pub fn from_directive(directive: i64) -> Self {
        match usize::try_from(directive).ok().and_then(NonZeroUsize::new) {
            Some(count) => WorkerCount::Count(count),
            None if directive == 0 => WorkerCount::AvailableParallelism,
            None => {
                let excluded = usize::try_from(directive.unsigned_abs()).unwrap_or(usize::MAX);
                WorkerCount::AllBut(excluded)
            }
        }
    }

    /// Resolves this directive to a concrete number of workers.
    pub fn resolve(self) -> Result<NonZeroUsize, Error> {
        match self {
            WorkerCount::Count(count) => Ok(count),
            WorkerCount::AvailableParallelism => available_parallelism(),
            WorkerCount::AllBut(excluded) => {
                let available = available_parallelism()?;
                available
                    .get()
                    .checked_sub(excluded)
                    .and_then(NonZeroUsize::new)
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "excluding {excluded} of {available} available cores leaves no worker"
                        ))
                    })
            }
        }
    }
}

impl Default for WorkerCount {
    /// All cores but one.
    fn default() -> Self {
        WorkerCount::AllBut(1)
    }
}

impl TryFrom<usize> for WorkerCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(worker_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(worker_count)?;
        Ok(WorkerCount::Count(count))
    }
}

impl FromStr for WorkerCount {
    type Err = Error;

    /// Parses either `auto` (the default directive) or an integer directive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(WorkerCount::default());
        }
        s.parse::<i64>()
            .map(WorkerCount::from_directive)
            .map_err(|e| Error::Configuration(format!("invalid worker directive {s:?}: {e}")))
    }
}

fn available_parallelism() -> Result<NonZeroUsize, Error> {
    std::thread::available_parallelism().map_err(|e| {
        Error::Configuration(format!("failed to query the available parallelism: {e}"))
    })
}

/// A builder for [`Engine`].
///
/// ```
/// # use forkpool::{Direct, EngineBuilder, NoProgress, WorkerCount};
/// # use std::time::Duration;
/// let mut engine = EngineBuilder {
///     workers: WorkerCount::try_from(2).unwrap(),
///     stall_timeout: Duration::from_secs(5),
/// }
/// .build(NoProgress);
///
/// let squares = engine
///     .parallelize(
///         &Direct(|x: u64| Ok::<_, String>(x * x)),
///         vec![(1,), (2,), (3,), (4,)],
///     )
///     .unwrap();
/// assert_eq!(squares, [1, 4, 9, 16]);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct EngineBuilder {
    /// Number of worker processes to spawn for each call.
    pub workers: WorkerCount,
    /// Maximal delay between two progress events before a call is aborted.
    pub stall_timeout: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            workers: WorkerCount::default(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

impl EngineBuilder {
    /// Creates an engine reporting progress to the given reporter.
    pub fn build<P: ProgressReporter>(&self, reporter: P) -> Engine<P> {
        Engine::new(self.workers, self.stall_timeout, reporter)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_directive_positive_is_absolute() {
        assert_eq!(
            WorkerCount::from_directive(3),
            WorkerCount::Count(NonZeroUsize::new(3).unwrap())
        );
        assert_eq!(WorkerCount::from_directive(3).resolve().unwrap().get(), 3);
    }

    #[test]
    fn test_directive_non_positive_is_relative() {
        let available = std::thread::available_parallelism().unwrap();
        assert_eq!(WorkerCount::from_directive(0).resolve().unwrap(), available);
        assert_eq!(WorkerCount::from_directive(-2), WorkerCount::AllBut(2));
        assert_eq!(
            WorkerCount::from_directive(i64::MIN),
            WorkerCount::AllBut(usize::try_from(i64::MIN.unsigned_abs()).unwrap())
        );
    }

    #[test]
    fn test_all_but_everything_is_a_configuration_error() {
        let available = std::thread::available_parallelism().unwrap().get();
        let err = WorkerCount::AllBut(available).resolve().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");
        let err = WorkerCount::AllBut(usize::MAX).resolve().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");
    }

    #[test]
    fn test_parse_directive() {
        assert_eq!(
            "auto".parse::<WorkerCount>().unwrap(),
            WorkerCount::AllBut(1)
        );
        assert_eq!(
            " 8 ".parse::<WorkerCount>().unwrap(),
            WorkerCount::try_from(8).unwrap()
        );
        assert_eq!("-3".parse::<WorkerCount>().unwrap(), WorkerCount::AllBut(3));
        assert!(matches!("many".parse::<WorkerCount>(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_try_from_zero_fails() {
        assert!(WorkerCount::try_from(0).is_err());
    }

    #[test]
    fn test_default_builder() {
        let builder = EngineBuilder::default();
        assert_eq!(builder.workers, WorkerCount::AllBut(1));
        assert_eq!(builder.stall_timeout, Duration::from_secs(10));
    }
}
