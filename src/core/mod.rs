// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: partitioning, worker processes, their wire protocol and the
//! progress channel.

pub(crate) mod channel;
pub(crate) mod partition;
pub(crate) mod pool;
pub(crate) mod process;
pub(crate) mod stream;
pub(crate) mod wire;
