// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Progress channel between the workers and the controlling thread.
//!
//! Workers report to the controller over their own pipe; one reader thread per
//! worker forwards these reports here, so that the controller drains a single
//! channel with many writers.

use crossbeam_channel::{Receiver, Sender};

/// Progress event of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProgressEvent {
    /// One task completed, in some worker.
    CompletedOne,
    /// All the workers returned their results. Sent exactly once, after every
    /// [`CompletedOne`](Self::CompletedOne) event of the call.
    AllChunksDone,
}

/// Sending half of the progress channel.
#[derive(Clone)]
pub(crate) struct ProgressSink {
    sender: Sender<ProgressEvent>,
}

impl ProgressSink {
    /// Reports an event. Events sent after the controller stopped listening
    /// are dropped.
    pub(crate) fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Creates an unbounded progress channel.
pub(crate) fn progress_channel() -> (ProgressSink, Receiver<ProgressEvent>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ProgressSink { sender }, receiver)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_events_from_many_writers_arrive_before_done() {
        let (sink, receiver) = progress_channel();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let sink = sink.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        sink.emit(ProgressEvent::CompletedOne);
                    }
                });
            }
        });
        sink.emit(ProgressEvent::AllChunksDone);

        let events: Vec<_> = receiver.try_iter().collect();
        assert_eq!(events.len(), 401);
        assert_eq!(events.last(), Some(&ProgressEvent::AllChunksDone));
        assert!(events[..400]
            .iter()
            .all(|e| *e == ProgressEvent::CompletedOne));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, receiver) = progress_channel();
        drop(receiver);
        sink.emit(ProgressEvent::CompletedOne);
    }
}
