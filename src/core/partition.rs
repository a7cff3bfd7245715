// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Contiguous split of the input into one chunk per worker.

use std::num::NonZeroUsize;
use std::ops::Range;

/// Range of input indices assigned to the given worker.
///
/// The range `0..num_elements` is split into `num_workers` contiguous ranges
/// whose lengths differ by at most one, in worker order.
pub(crate) fn chunk_range(
    id: usize,
    num_workers: NonZeroUsize,
    num_elements: usize,
) -> Range<usize> {
    let num_workers = num_workers.get();
    let start = (id * num_elements) / num_workers;
    let end = ((id + 1) * num_elements) / num_workers;
    start..end
}

/// Splits the input into exactly `num_workers` chunks.
///
/// Concatenating the chunks in order yields the input back. If there are fewer
/// elements than workers, some chunks are empty.
pub(crate) fn partition<T>(mut items: Vec<T>, num_workers: NonZeroUsize) -> Vec<Vec<T>> {
    let num_elements = items.len();
    let mut chunks: Vec<Vec<T>> = (0..num_workers.get())
        .rev()
        .map(|id| items.split_off(chunk_range(id, num_workers, num_elements).start))
        .collect();
    debug_assert!(items.is_empty());
    chunks.reverse();
    chunks
}
