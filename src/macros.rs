// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Logging macros of the controlling process.
//!
//! All the events are logged under the `forkpool::controller` target, and
//! compile to nothing without the `log` feature. Forked workers never log: the logger's
//! locks may have been held by another thread at the time of the fork.

/// Log target of all the events of this crate.
#[cfg(feature = "log")]
pub(crate) const TARGET: &str = "forkpool::controller";

/// Logs an event at the given level.
#[cfg(feature = "log")]
macro_rules! controller_log {
    ( $level:ident, $($args:tt)* ) => {
        log::$level!(target: $crate::macros::TARGET, $($args)*)
    };
}

#[cfg(not(feature = "log"))]
macro_rules! controller_log {
    ( $level:ident, $($args:tt)* ) => {
        ()
    };
}

macro_rules! log_debug {
    ( $($args:tt)* ) => {
        $crate::macros::controller_log!(debug, $($args)*)
    };
}

macro_rules! log_info {
    ( $($args:tt)* ) => {
        $crate::macros::controller_log!(info, $($args)*)
    };
}

macro_rules! log_warn {
    ( $($args:tt)* ) => {
        $crate::macros::controller_log!(warn, $($args)*)
    };
}

macro_rules! log_error {
    ( $($args:tt)* ) => {
        $crate::macros::controller_log!(error, $($args)*)
    };
}

pub(crate) use {controller_log, log_debug, log_error, log_info, log_warn};
