// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker processes: forking, termination and reaping.

use crate::error::Error;
use crate::macros::{log_debug, log_warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::AsFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// How often a blocked reader checks whether the call was aborted.
const ABORT_POLL_INTERVAL_MS: u16 = 50;

/// Ends of a worker's pipes held by the controller.
pub(crate) struct WorkerPipes {
    /// Reads what the worker writes.
    pub from_worker: File,
    /// Writes what the worker reads.
    pub to_worker: File,
}

/// Ends of a worker's pipes held by the worker itself.
pub(crate) struct ChildPipes {
    /// Reads what the controller writes.
    pub input: File,
    /// Writes to the controller.
    pub output: File,
}

/// Handle to a forked worker process.
pub(crate) struct WorkerProcess {
    /// Worker index.
    id: usize,
    /// Process ID of the worker.
    pid: Pid,
    /// Whether the process has been waited for. Once reaped, the PID may be
    /// reused by the system and must not be signaled anymore.
    reaped: bool,
}

/// Forks a worker process running the given body.
///
/// The body only ever runs in the child, which exits as soon as the body
/// returns, with a status reflecting the returned success flag. A panic
/// escaping the body is caught and exits the child too: the child never
/// unwinds into the controller's stack nor runs its destructors.
///
/// The body must not log nor use any lock shared with other threads of the
/// controller, as another thread may have held it at the time of the fork.
///
/// The pipes are close-on-exec, so programs executed by a task don't hold
/// them open.
pub(crate) fn spawn(
    id: usize,
    body: impl FnOnce(ChildPipes) -> bool,
) -> Result<(WorkerProcess, WorkerPipes), Error> {
    let (to_worker_read, to_worker_write) = pipe2(OFlag::O_CLOEXEC).map_err(Error::Spawn)?;
    let (from_worker_read, from_worker_write) = pipe2(OFlag::O_CLOEXEC).map_err(Error::Spawn)?;

    // SAFETY: the child only runs `body` on its own copy of the address space
    // and then calls `_exit()`, without returning to the caller.
    match unsafe { fork() }.map_err(Error::Spawn)? {
        ForkResult::Child => {
            drop(to_worker_write);
            drop(from_worker_read);
            let pipes = ChildPipes {
                input: File::from(to_worker_read),
                output: File::from(from_worker_write),
            };
            let success = catch_unwind(AssertUnwindSafe(|| body(pipes))).unwrap_or(false);
            // SAFETY: `_exit()` terminates the process immediately. Skipping the
            // exit handlers and destructors copied from the controller is
            // exactly what is wanted here.
            unsafe { nix::libc::_exit(if success { 0 } else { 1 }) }
        }
        ForkResult::Parent { child } => {
            drop(to_worker_read);
            drop(from_worker_write);
            log_debug!("Spawned worker #{id} as process {child}");
            Ok((
                WorkerProcess {
                    id,
                    pid: child,
                    reaped: false,
                },
                WorkerPipes {
                    from_worker: File::from(from_worker_read),
                    to_worker: File::from(to_worker_write),
                },
            ))
        }
    }
}

impl WorkerProcess {
    /// Sends `SIGKILL` to the worker, unless it was already reaped.
    fn kill(&self) {
        if self.reaped {
            return;
        }
        match kill(self.pid, Signal::SIGKILL) {
            // The process already exited and is waiting to be reaped.
            Ok(()) | Err(Errno::ESRCH) => (),
            Err(_e) => log_warn!(
                "Failed to kill worker #{} (process {}): {_e}",
                self.id,
                self.pid
            ),
        }
    }

    /// Waits for the worker to exit.
    fn reap(&mut self) {
        if self.reaped {
            return;
        }
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(WaitStatus::Exited(_, 0)) => {
                    log_debug!("Worker #{} exited", self.id);
                }
                Ok(_status) => {
                    log_debug!("Worker #{} terminated: {_status:?}", self.id);
                }
                Err(_e) => {
                    log_warn!(
                        "Failed to wait for worker #{} (process {}): {_e}",
                        self.id,
                        self.pid
                    );
                }
            }
            break;
        }
        self.reaped = true;
    }
}

impl Drop for WorkerProcess {
    /// Terminates and reaps the worker if that wasn't done already.
    fn drop(&mut self) {
        self.kill();
        self.reap();
    }
}

/// All the worker processes of a call.
pub(crate) struct WorkerSet {
    workers: Mutex<Vec<WorkerProcess>>,
    aborted: AtomicBool,
}

impl WorkerSet {
    pub(crate) fn new(workers: Vec<WorkerProcess>) -> Self {
        Self {
            workers: Mutex::new(workers),
            aborted: AtomicBool::new(false),
        }
    }

    /// Kills all the workers that are still running, and marks the call as
    /// aborted so that [`WorkerReader`]s stop waiting for more data.
    pub(crate) fn kill_all(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter() {
            worker.kill();
        }
    }

    /// Whether [`kill_all()`](Self::kill_all) was called.
    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Waits for all the workers to exit.
    pub(crate) fn reap_all(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter_mut() {
            worker.reap();
        }
    }

    /// Process IDs of the workers that haven't been reaped.
    #[cfg(test)]
    pub(crate) fn live_pids(&self) -> Vec<Pid> {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers
            .iter()
            .filter(|w| !w.reaped)
            .map(|w| w.pid)
            .collect()
    }
}

/// Reads from a worker's output pipe until the call is aborted.
///
/// The write end of the pipe may outlive the worker, in a process that the
/// worker forked or in a worker spawned later for another call. Once the
/// call is aborted, reading stops with [`ErrorKind::ConnectionAborted`]
/// instead of waiting for an end of file that may never come. Data already
/// in the pipe is still returned first.
pub(crate) struct WorkerReader<'a> {
    pipe: File,
    workers: &'a WorkerSet,
}

impl<'a> WorkerReader<'a> {
    pub(crate) fn new(pipe: File, workers: &'a WorkerSet) -> Self {
        Self { pipe, workers }
    }
}

impl Read for WorkerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut fds = [PollFd::new(self.pipe.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ABORT_POLL_INTERVAL_MS)) {
                // Readable, closed or in error: the read won't block.
                Ok(n) if n > 0 => return self.pipe.read(buf),
                Ok(_) => {
                    if self.workers.is_aborted() {
                        return Err(io::Error::new(
                            ErrorKind::ConnectionAborted,
                            "the call was aborted",
                        ));
                    }
                }
                Err(Errno::EINTR) => (),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn is_alive(pid: Pid) -> bool {
        kill(pid, None).is_ok()
    }

    #[test]
    fn test_worker_echoes_input() {
        let (mut process, pipes) = spawn(0, |child| {
            let ChildPipes {
                mut input,
                mut output,
            } = child;
            let mut buf = Vec::new();
            input.read_to_end(&mut buf).is_ok() && output.write_all(&buf).is_ok()
        })
        .unwrap();

        let WorkerPipes {
            mut from_worker,
            mut to_worker,
        } = pipes;
        to_worker.write_all(b"hello").unwrap();
        drop(to_worker);
        let mut echoed = Vec::new();
        from_worker.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, b"hello");

        process.reap();
        assert!(process.reaped);
    }

    #[test]
    fn test_kill_all_terminates_hung_workers() {
        let mut processes = Vec::new();
        let mut pipes = Vec::new();
        for id in 0..2 {
            let (process, worker_pipes) = spawn(id, |_child| {
                std::thread::sleep(Duration::from_secs(60));
                true
            })
            .unwrap();
            processes.push(process);
            pipes.push(worker_pipes);
        }
        let workers = WorkerSet::new(processes);
        let pids = workers.live_pids();
        assert_eq!(pids.len(), 2);

        let start = Instant::now();
        workers.kill_all();
        assert!(workers.is_aborted());
        // The pipes close once the workers are gone.
        for mut worker_pipes in pipes {
            let mut buf = Vec::new();
            worker_pipes.from_worker.read_to_end(&mut buf).unwrap();
            assert!(buf.is_empty());
        }
        workers.reap_all();
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(workers.live_pids().is_empty());
        for pid in pids {
            assert!(!is_alive(pid));
        }
    }

    #[test]
    fn test_reader_stops_once_aborted() {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        // Another process holding the write end open.
        let mut write = File::from(write);
        let workers = WorkerSet::new(Vec::new());
        let mut reader = WorkerReader::new(File::from(read), &workers);

        write.write_all(b"ok").unwrap();
        workers.kill_all();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");

        let start = Instant::now();
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_reader_waits_while_running() {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let mut write = File::from(write);
        let workers = WorkerSet::new(Vec::new());
        let mut reader = WorkerReader::new(File::from(read), &workers);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(200));
                write.write_all(b"late").unwrap();
            });
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4];
            while buf.len() < 4 {
                let n = reader.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            assert_eq!(buf, b"late");
        });
        assert!(!workers.is_aborted());
    }

    #[test]
    fn test_drop_reaps_worker() {
        let (process, _pipes) = spawn(0, |_child| {
            std::thread::sleep(Duration::from_secs(60));
            true
        })
        .unwrap();
        let pid = process.pid;
        drop(process);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_panicking_body_exits_with_failure() {
        let (mut process, _pipes) = spawn(0, |_child| panic!("worker body panicked")).unwrap();
        let status = waitpid(process.pid, None).unwrap();
        process.reaped = true;
        assert_eq!(status, WaitStatus::Exited(process.pid, 1));
    }
}
