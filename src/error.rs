use std::io;

use nix::errno::Errno;

/// Failures surfaced by `start` before any process, thread or descriptor has
/// been committed.
///
/// Anything that goes wrong after a node is running (a failed write inside a
/// background worker, an external command that could not replace its process
/// image) is never an `Error`; it comes back as the status code of `wait`.
/// Callers rely on that boundary to know whether resources were committed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested descriptor wiring is outside the node's capability.
    #[error("wrong descriptor option for {0}")]
    StreamMismatch(&'static str),

    /// Neither side of the pipe can create a descriptor the other accepts.
    #[error("invalid pipe connection")]
    InvalidPipe,

    /// Capture has nowhere to store its variable.
    #[error("cannot capture into a read-only environment")]
    ReadOnlyEnvironment,

    /// A variable reference did not resolve.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    /// An OS primitive failed while setting the node up.
    #[error("{call} failed")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn syscall(call: &'static str, errno: Errno) -> Error {
        Error::Syscall {
            call,
            source: io::Error::from_raw_os_error(errno as i32),
        }
    }

    pub(crate) fn io(call: &'static str, source: io::Error) -> Error {
        Error::Syscall { call, source }
    }

    /// True for pure validation failures: nothing was opened, forked or
    /// spawned, so the caller's resources are untouched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::StreamMismatch(_) | Error::InvalidPipe | Error::ReadOnlyEnvironment
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
