//! Per-variant start logic: stream negotiation, pipe allocation, fork/exec
//! and background workers.
//!
//! Descriptor ownership follows one handoff rule: a descriptor passed to a
//! node as [`Slot::Handle`] is consumed when that node's start succeeds; a
//! failed start leaves it with the caller. A composite that committed one
//! side before failing reports the slots that side already took through
//! [`StartFailure`], and the pipe logic holds its created end as an
//! `OwnedFd` until the accepting side has taken it.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::thread;

use nix::fcntl::OFlag;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{execvpe, fork, pipe2, ForkResult};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::node::{Node, OpenMode};
use crate::running::{Child, Inert, Pair, Running, Task};
use crate::stream::{Slot, Streams};
use crate::value::Value;

/// Exit code a forked child reports when its argv cannot be resolved.
const CHILD_SETUP_FAILED: i32 = 127;

const READ_CHUNK: usize = 1024;

/// A failed start, plus which caller-supplied descriptors were consumed
/// before the failure. Leaves never consume on failure; a pipe that
/// committed one side reports the request slots that side already took.
/// Pipes forward only stdin and stdout, so those are the only slots a
/// composite can consume.
pub(crate) struct StartFailure {
    pub(crate) error: Error,
    consumed_stdin: bool,
    consumed_stdout: bool,
}

impl From<Error> for StartFailure {
    fn from(error: Error) -> StartFailure {
        StartFailure {
            error,
            consumed_stdin: false,
            consumed_stdout: false,
        }
    }
}

pub(crate) type StartResult = std::result::Result<Box<dyn Running>, StartFailure>;

/// Validate the request against the node's capability, then dispatch.
pub(crate) fn start_checked(node: &Node, streams: Streams, env: &Env) -> StartResult {
    node.caps().check(&streams)?;
    match node {
        Node::Exec { argv } => start_exec(argv, streams, env),
        Node::Pipe { lhs, rhs } => start_pipe(lhs, rhs, streams, env),
        Node::And { lhs, rhs } => start_chain(Chain::And, lhs, rhs, streams, env),
        Node::Or { lhs, rhs } => start_chain(Chain::Or, lhs, rhs, streams, env),
        Node::Capture { name } => start_capture(name, streams, env),
        Node::Emit { words } => start_emit(words, streams, env),
        Node::Redirect { path, mode } => start_redirect(path, *mode, env),
        Node::Succeed => Ok(Box::new(Inert::new(Streams::default(), 0))),
        Node::Fail => Ok(Box::new(Inert::new(Streams::default(), -1))),
    }
}

/// How one standard stream of a forked child gets wired.
enum Wired {
    /// Nothing requested; the child inherits this process's descriptor.
    Inherit,
    /// Caller-supplied descriptor: duplicated onto the child's standard
    /// slot, closed here only after the fork has succeeded.
    Adopt(RawFd),
    /// Freshly allocated pipe. `ours` stays in this process and is exposed
    /// through the running instance; `theirs` is the child's end.
    Piped { ours: OwnedFd, theirs: OwnedFd },
}

impl Wired {
    fn prepare(slot: Slot, child_reads: bool) -> Result<Wired> {
        match slot {
            Slot::Absent => Ok(Wired::Inherit),
            Slot::Handle(fd) => Ok(Wired::Adopt(fd)),
            Slot::New => {
                let (read_end, write_end) =
                    pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::syscall("pipe2", e))?;
                Ok(if child_reads {
                    Wired::Piped {
                        ours: write_end,
                        theirs: read_end,
                    }
                } else {
                    Wired::Piped {
                        ours: read_end,
                        theirs: write_end,
                    }
                })
            }
        }
    }
}

fn start_exec(argv: &[Value], streams: Streams, env: &Env) -> StartResult {
    tracing::debug!(argv = ?argv, "starting external command");
    let stdin = Wired::prepare(streams.stdin, true)?;
    let stdout = Wired::prepare(streams.stdout, false)?;
    let stderr = Wired::prepare(streams.stderr, false)?;

    // Snapshot under the lock now; the child must never touch the shared
    // store after the fork.
    let vars = env.values_snapshot();
    let exported = env.exportable_pairs();

    match unsafe { fork() }.map_err(|e| Error::syscall("fork", e))? {
        ForkResult::Child => exec_child(argv, &vars, &exported, &stdin, &stdout, &stderr),
        ForkResult::Parent { child } => {
            tracing::debug!(pid = child.as_raw(), "forked");
            let actual = Streams {
                stdin: release_parent(stdin, streams.stdin),
                stdout: release_parent(stdout, streams.stdout),
                stderr: release_parent(stderr, streams.stderr),
            };
            Ok(Box::new(Child::new(child, actual)))
        }
    }
}

/// Parent-side handoff after a successful fork: close the ends the child
/// owns now, keep our pipe ends. Adopted descriptors are consumed here;
/// their slot still reports the original number.
fn release_parent(wired: Wired, requested: Slot) -> Slot {
    match wired {
        Wired::Inherit => Slot::Absent,
        Wired::Adopt(fd) => {
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
            requested
        }
        Wired::Piped { ours, theirs } => {
            drop(theirs);
            Slot::Handle(ours.into_raw_fd())
        }
    }
}

/// Child side of the fork. Wires descriptors onto the standard slots,
/// resolves argv against the pre-fork snapshot and replaces the process
/// image; never returns into caller code.
fn exec_child(
    argv: &[Value],
    vars: &BTreeMap<String, String>,
    exported: &[String],
    stdin: &Wired,
    stdout: &Wired,
    stderr: &Wired,
) -> ! {
    wire_child(stdin, libc::STDIN_FILENO);
    wire_child(stdout, libc::STDOUT_FILENO);
    wire_child(stderr, libc::STDERR_FILENO);

    // The hosting Rust process ignores SIGPIPE; the command must not
    // inherit that disposition.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }

    let mut words = Vec::with_capacity(argv.len());
    for value in argv {
        let word = match value.resolve_with(vars).map(CString::new) {
            Ok(Ok(word)) => word,
            _ => unsafe { libc::_exit(CHILD_SETUP_FAILED) },
        };
        words.push(word);
    }
    if words.is_empty() {
        unsafe { libc::_exit(CHILD_SETUP_FAILED) };
    }
    let block: Vec<CString> = exported
        .iter()
        .filter_map(|pair| CString::new(pair.as_str()).ok())
        .collect();

    let errno = match execvpe(&words[0], &words, &block) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    unsafe { libc::_exit(errno as i32) }
}

fn wire_child(wired: &Wired, target: RawFd) {
    match wired {
        Wired::Inherit => {}
        Wired::Adopt(fd) => unsafe {
            libc::dup2(*fd, target);
        },
        Wired::Piped { ours, theirs } => unsafe {
            libc::close(ours.as_raw_fd());
            libc::dup2(theirs.as_raw_fd(), target);
        },
    }
}

fn start_pipe(lhs: &Node, rhs: &Node, streams: Streams, env: &Env) -> StartResult {
    let lcaps = lhs.caps();
    let rcaps = rhs.caps();

    // The descriptor-creating side starts first. Its produced end is held
    // here and offered to the other side; ownership transfers only once
    // that side has started. The caller's stderr is validated against this
    // pipe's capability but is not forwarded to either side.
    if lcaps.stdout.allows_create() && rcaps.stdin.allows_accept() {
        tracing::trace!("pipe wiring: left creates, right accepts");
        let left = match start_checked(
            lhs,
            Streams {
                stdin: streams.stdin,
                stdout: Slot::New,
                stderr: Slot::Absent,
            },
            env,
        ) {
            Ok(left) => left,
            Err(failure) => {
                return Err(StartFailure {
                    error: failure.error,
                    consumed_stdin: failure.consumed_stdin,
                    consumed_stdout: false,
                })
            }
        };
        let handoff = hold_handle(left.streams().stdout);
        match start_checked(
            rhs,
            Streams {
                stdin: as_request(&handoff),
                stdout: streams.stdout,
                stderr: Slot::Absent,
            },
            env,
        ) {
            Ok(right) => {
                release_handle(handoff);
                Ok(Box::new(Pair::new(left, right)))
            }
            Err(failure) => {
                if failure.consumed_stdin {
                    release_handle(handoff);
                } else {
                    // Closing the held end gives the started side EOF or
                    // EPIPE, so the reap below cannot block.
                    drop(handoff);
                }
                reap_abandoned(left);
                Err(StartFailure {
                    error: failure.error,
                    consumed_stdin: true,
                    consumed_stdout: failure.consumed_stdout,
                })
            }
        }
    } else if lcaps.stdout.allows_accept() && rcaps.stdin.allows_create() {
        tracing::trace!("pipe wiring: right creates, left accepts");
        let right = match start_checked(
            rhs,
            Streams {
                stdin: Slot::New,
                stdout: streams.stdout,
                stderr: Slot::Absent,
            },
            env,
        ) {
            Ok(right) => right,
            Err(failure) => {
                return Err(StartFailure {
                    error: failure.error,
                    consumed_stdin: false,
                    consumed_stdout: failure.consumed_stdout,
                })
            }
        };
        let handoff = hold_handle(right.streams().stdin);
        match start_checked(
            lhs,
            Streams {
                stdin: streams.stdin,
                stdout: as_request(&handoff),
                stderr: Slot::Absent,
            },
            env,
        ) {
            Ok(left) => {
                release_handle(handoff);
                Ok(Box::new(Pair::new(left, right)))
            }
            Err(failure) => {
                if failure.consumed_stdout {
                    release_handle(handoff);
                } else {
                    drop(handoff);
                }
                reap_abandoned(right);
                Err(StartFailure {
                    error: failure.error,
                    consumed_stdin: failure.consumed_stdin,
                    consumed_stdout: true,
                })
            }
        }
    } else {
        Err(Error::InvalidPipe.into())
    }
}

/// Take ownership of the end the creating side exposed.
fn hold_handle(slot: Slot) -> Option<OwnedFd> {
    match slot {
        Slot::Handle(fd) => Some(unsafe { OwnedFd::from_raw_fd(fd) }),
        _ => None,
    }
}

fn as_request(held: &Option<OwnedFd>) -> Slot {
    match held {
        Some(fd) => Slot::Handle(fd.as_raw_fd()),
        None => Slot::Absent,
    }
}

/// Hand the held end over without closing it.
fn release_handle(held: Option<OwnedFd>) {
    if let Some(fd) = held {
        let _ = fd.into_raw_fd();
    }
}

/// Reap the already-started side of a pipe after its partner failed to
/// start; its handed-off descriptor has been closed by then, so the wait
/// terminates.
fn reap_abandoned(mut side: Box<dyn Running>) {
    let status = side.wait();
    tracing::debug!(status, "reaped pipe side after partner failed to start");
}

#[derive(Clone, Copy, Debug)]
enum Chain {
    And,
    Or,
}

fn start_chain(kind: Chain, lhs: &Node, rhs: &Node, streams: Streams, env: &Env) -> StartResult {
    let lhs = lhs.clone();
    let rhs = rhs.clone();
    let env = env.share();
    let name = match kind {
        Chain::And => "and-chain",
        Chain::Or => "or-chain",
    };
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let first = finished_status(&lhs, &env);
            // The second operand must not start unless the first leaves the
            // outcome undetermined.
            let ok = match kind {
                Chain::And => first == 0 && finished_status(&rhs, &env) == 0,
                Chain::Or => first == 0 || finished_status(&rhs, &env) == 0,
            };
            if ok {
                0
            } else {
                1
            }
        })
        .map_err(|e| Error::io("spawn", e))?;
    Ok(Box::new(Task::new(handle, streams)))
}

/// Run a chain operand to completion. Start errors have no propagation
/// channel out of the chain thread; they degrade into a failure status.
fn finished_status(node: &Node, env: &Env) -> i32 {
    match node.run(env) {
        Ok(status) => status,
        Err(err) => {
            tracing::warn!(error = %err, "chain operand failed to start");
            -1
        }
    }
}

/// A worker's end of the wiring, adopted only once the worker thread is
/// actually running; a failed spawn leaves a caller-supplied descriptor
/// with the caller.
enum Endpoint {
    Created(OwnedFd),
    Given(RawFd),
}

impl Endpoint {
    fn adopt(self) -> OwnedFd {
        match self {
            Endpoint::Created(fd) => fd,
            Endpoint::Given(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
        }
    }
}

fn start_capture(name: &str, streams: Streams, env: &Env) -> StartResult {
    if !env.is_writable() {
        return Err(Error::ReadOnlyEnvironment.into());
    }
    let (source, ours) = match streams.stdin {
        Slot::New => {
            let (read_end, write_end) =
                pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::syscall("pipe2", e))?;
            (Endpoint::Created(read_end), Some(write_end))
        }
        Slot::Handle(fd) => (Endpoint::Given(fd), None),
        Slot::Absent => return Err(Error::StreamMismatch("stdin").into()),
    };
    let shared = env.share();
    let name = name.to_string();
    let handle = thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || read_into_var(source.adopt(), &name, &shared))
        .map_err(|e| Error::io("spawn", e))?;
    let exposed = match ours {
        Some(write_end) => Slot::Handle(write_end.into_raw_fd()),
        None => streams.stdin,
    };
    Ok(Box::new(Task::new(
        handle,
        Streams {
            stdin: exposed,
            ..Streams::default()
        },
    )))
}

fn read_into_var(source: OwnedFd, name: &str, env: &Env) -> i32 {
    let mut source = File::from(source);
    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(count) => data.extend_from_slice(&chunk[..count]),
            Err(err) => {
                tracing::warn!(error = %err, "capture read failed");
                return err.raw_os_error().unwrap_or(-1);
            }
        }
    }
    if data.last() == Some(&b'\n') {
        data.pop();
    }
    let text = String::from_utf8_lossy(&data).into_owned();
    tracing::trace!(name, bytes = text.len(), "captured variable");
    // Writability was established before the thread existed.
    match env.set(name, &text, false) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn start_emit(words: &[Value], streams: Streams, env: &Env) -> StartResult {
    let (sink, ours) = match streams.stdout {
        Slot::New => {
            let (read_end, write_end) =
                pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::syscall("pipe2", e))?;
            (Endpoint::Created(write_end), Some(read_end))
        }
        Slot::Handle(fd) => (Endpoint::Given(fd), None),
        Slot::Absent => return Err(Error::StreamMismatch("stdout").into()),
    };
    let shared = env.share();
    let words = words.to_vec();
    let handle = thread::Builder::new()
        .name("emit".to_string())
        .spawn(move || write_words(sink.adopt(), &words, &shared))
        .map_err(|e| Error::io("spawn", e))?;
    let exposed = match ours {
        Some(read_end) => Slot::Handle(read_end.into_raw_fd()),
        None => streams.stdout,
    };
    Ok(Box::new(Task::new(
        handle,
        Streams {
            stdout: exposed,
            ..Streams::default()
        },
    )))
}

fn write_words(sink: OwnedFd, words: &[Value], env: &Env) -> i32 {
    let mut sink = File::from(sink);
    let last = words.len().saturating_sub(1);
    for (index, word) in words.iter().enumerate() {
        let text = match word.resolve(env) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "emit word failed to resolve");
                return -1;
            }
        };
        let separator: &[u8] = if index == last { b"\n" } else { b" " };
        let written = sink
            .write_all(text.as_bytes())
            .and_then(|()| sink.write_all(separator));
        if let Err(err) = written {
            tracing::warn!(error = %err, "emit write failed");
            return err.raw_os_error().unwrap_or(-1);
        }
    }
    if words.is_empty() {
        if let Err(err) = sink.write_all(b"\n") {
            return err.raw_os_error().unwrap_or(-1);
        }
    }
    0
}

fn start_redirect(path: &Value, mode: OpenMode, env: &Env) -> StartResult {
    let path = path.resolve(env)?;
    let mut options = OpenOptions::new();
    options.mode(0o644);
    if mode.reads() {
        options.read(true);
    }
    if mode.writes() {
        if mode.appends() {
            options.append(true);
        } else if mode.reads() {
            options.write(true);
        } else {
            options.write(true).truncate(true);
        }
        options.create(true);
    } else {
        // Missing files are created in read-only mode too.
        options.custom_flags(libc::O_CREAT);
    }
    let file = options.open(&path).map_err(|e| Error::io("open", e))?;
    tracing::debug!(%path, ?mode, "opened redirect target");
    let fd = file.into_raw_fd();
    let streams = Streams {
        stdin: if mode.writes() {
            Slot::Handle(fd)
        } else {
            Slot::Absent
        },
        stdout: if mode.reads() {
            Slot::Handle(fd)
        } else {
            Slot::Absent
        },
        stderr: Slot::Absent,
    };
    Ok(Box::new(Inert::new(streams, 0)))
}
