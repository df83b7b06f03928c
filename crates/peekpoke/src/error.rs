use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An input violated a documented precondition.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The environment does not look like it should (procfs missing or
    /// serving malformed records).
    #[error("{0}")]
    Unexpected(String),

    /// A trace or signal call failed; `call` names the failing request.
    #[error("{call} failed: {errno}")]
    Os {
        call: &'static str,
        #[source]
        errno: Errno,
    },

    /// File open/read/seek error on the procfs.
    #[error("{0}: {1}")]
    File(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No `/proc` entry for the given pid.
    #[error("no such process: {0}")]
    NoProcess(Pid),

    #[error("bad wait status: {0:?}")]
    BadWait(WaitStatus),

    #[error("memory read/write {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),
}

impl Error {
    pub(crate) fn os(call: &'static str, errno: Errno) -> Self {
        Self::Os { call, errno }
    }

    /// Error number of the underlying OS failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os { errno, .. } => Some(*errno),
            Self::File(_, e) | Self::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
