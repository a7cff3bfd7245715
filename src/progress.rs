// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Rendering of the progress of a call.

use std::io::Write;
use std::num::NonZeroUsize;

/// Receiver of progress notifications from an [`Engine`](crate::Engine).
///
/// All methods are called from the thread that drives the call, never from a
/// worker process.
pub trait ProgressReporter {
    /// Notifies that a call is about to run on the given number of workers.
    fn announce(&mut self, _workers: NonZeroUsize) {}

    /// Renders the fraction of completed tasks, in `[0.0, 1.0]`.
    ///
    /// The same fraction may be reported more than once.
    fn report(&mut self, fraction: f64);
}

impl<P: ProgressReporter + ?Sized> ProgressReporter for &mut P {
    fn announce(&mut self, workers: NonZeroUsize) {
        (**self).announce(workers)
    }

    fn report(&mut self, fraction: f64) {
        (**self).report(fraction)
    }
}

/// A reporter that discards all notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&mut self, _fraction: f64) {}
}

/// Width of the bar, in characters.
const BAR_WIDTH: usize = 40;

/// A progress bar redrawn in place on a terminal-like output.
///
/// ```text
/// Running on 7 worker processes.
/// [################                        ]  42.00%
/// ```
pub struct ConsoleProgress<W: Write> {
    out: W,
}

impl ConsoleProgress<std::io::Stderr> {
    /// Creates a progress bar on the standard error.
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write> ConsoleProgress<W> {
    /// Creates a progress bar rendered to the given output.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Returns the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, fraction: f64) -> std::io::Result<()> {
        let fraction = fraction.clamp(0.0, 1.0);
        let filled = (fraction * BAR_WIDTH as f64).round() as usize;
        write!(
            self.out,
            "\r[{:#<filled$}{:<empty$}] {:>6.2}%",
            "",
            "",
            fraction * 100.0,
            empty = BAR_WIDTH - filled,
        )?;
        if fraction >= 1.0 {
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}

impl<W: Write> ProgressReporter for ConsoleProgress<W> {
    fn announce(&mut self, workers: NonZeroUsize) {
        // A broken console must not fail the computation.
        let _ = writeln!(self.out, "Running on {workers} worker processes.");
    }

    fn report(&mut self, fraction: f64) {
        let _ = self.render(fraction);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rendered(fractions: &[f64]) -> String {
        let mut progress = ConsoleProgress::new(Vec::new());
        for &fraction in fractions {
            progress.report(fraction);
        }
        String::from_utf8(progress.into_inner()).unwrap()
    }

    #[test]
    fn test_console_progress_renders_bar() {
        let out = rendered(&[0.0]);
        assert_eq!(out, format!("\r[{}]   0.00%", " ".repeat(BAR_WIDTH)));

        let out = rendered(&[0.5]);
        assert_eq!(
            out,
            format!("\r[{}{}]  50.00%", "#".repeat(20), " ".repeat(20))
        );
    }

    #[test]
    fn test_console_progress_ends_line_on_completion() {
        let out = rendered(&[0.25, 1.0]);
        assert!(out.ends_with(&format!("[{}] 100.00%\n", "#".repeat(BAR_WIDTH))));
        assert_eq!(out.matches('\n').count(), 1);
    }

    #[test]
    fn test_console_progress_is_idempotent() {
        let once = rendered(&[0.5]);
        let twice = rendered(&[0.5, 0.5]);
        assert_eq!(twice, once.repeat(2));
    }

    #[test]
    fn test_console_progress_clamps() {
        assert_eq!(rendered(&[-1.0]), rendered(&[0.0]));
        assert_eq!(rendered(&[3.0]), rendered(&[1.0]));
    }

    #[test]
    fn test_announce() {
        let mut progress = ConsoleProgress::new(Vec::new());
        progress.announce(NonZeroUsize::new(3).unwrap());
        assert_eq!(progress.into_inner(), b"Running on 3 worker processes.\n");
    }
}
