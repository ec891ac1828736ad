//! Live handles produced by `start`.
//!
//! Each node variant maps onto one of four shapes: a forked OS child, a
//! background worker thread, a pair of already-running pipe sides, or an
//! inert handle with a fixed result.

use std::thread::JoinHandle;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::stream::Streams;

/// Returned by `wait` when waiting itself failed. Never a valid exit status.
pub const WAIT_FAILED: i32 = -1;

/// A started node.
///
/// Owns whatever the node allocated (process, thread, descriptors) and is
/// done once `wait` has returned.
pub trait Running: Send {
    /// The descriptors actually in use, so a parent pipe can wire the next
    /// stage. Created slots report the caller-side pipe end; adopted slots
    /// report the descriptor that was handed in.
    fn streams(&self) -> Streams;

    /// Block until this unit of work has finished and return its status,
    /// 0 for success. Calling again returns the first result.
    fn wait(&mut self) -> i32;
}

/// A forked external command.
pub(crate) struct Child {
    pid: Pid,
    streams: Streams,
    status: Option<i32>,
}

impl Child {
    pub(crate) fn new(pid: Pid, streams: Streams) -> Child {
        Child {
            pid,
            streams,
            status: None,
        }
    }
}

impl Running for Child {
    fn streams(&self) -> Streams {
        self.streams
    }

    fn wait(&mut self) -> i32 {
        if let Some(status) = self.status {
            return status;
        }
        // WUNTRACED: a stopped child resolves the wait too, reporting the
        // stopping signal as its status.
        let status = match waitpid(self.pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, signal, _)) => signal as i32,
            Ok(WaitStatus::Stopped(_, signal)) => signal as i32,
            Ok(other) => {
                tracing::warn!(pid = self.pid.as_raw(), ?other, "unexpected wait status");
                WAIT_FAILED
            }
            Err(errno) => {
                tracing::warn!(pid = self.pid.as_raw(), %errno, "waitpid failed");
                WAIT_FAILED
            }
        };
        self.status = Some(status);
        status
    }
}

/// A background worker thread (boolean chains, capture, emit).
pub(crate) struct Task {
    handle: Option<JoinHandle<i32>>,
    streams: Streams,
    status: i32,
}

impl Task {
    pub(crate) fn new(handle: JoinHandle<i32>, streams: Streams) -> Task {
        Task {
            handle: Some(handle),
            streams,
            status: 0,
        }
    }
}

impl Running for Task {
    fn streams(&self) -> Streams {
        self.streams
    }

    fn wait(&mut self) -> i32 {
        if let Some(handle) = self.handle.take() {
            self.status = handle.join().unwrap_or(WAIT_FAILED);
        }
        self.status
    }
}

/// Both sides of a pipe.
pub(crate) struct Pair {
    left: Box<dyn Running>,
    right: Box<dyn Running>,
}

impl Pair {
    pub(crate) fn new(left: Box<dyn Running>, right: Box<dyn Running>) -> Pair {
        Pair { left, right }
    }
}

impl Running for Pair {
    fn streams(&self) -> Streams {
        Streams {
            stdin: self.left.streams().stdin,
            stdout: self.right.streams().stdout,
            stderr: self.right.streams().stderr,
        }
    }

    /// Waits on both sides and combines their statuses with bitwise OR:
    /// nonzero whenever either side failed, but the combined number is not
    /// itself a meaningful exit code.
    fn wait(&mut self) -> i32 {
        self.left.wait() | self.right.wait()
    }
}

/// A handle with no process or thread behind it (redirects, fixed results).
pub(crate) struct Inert {
    streams: Streams,
    status: i32,
}

impl Inert {
    pub(crate) fn new(streams: Streams, status: i32) -> Inert {
        Inert { streams, status }
    }
}

impl Running for Inert {
    fn streams(&self) -> Streams {
        self.streams
    }

    fn wait(&mut self) -> i32 {
        self.status
    }
}
