use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// The kind of a failure, used to tell recoverable I/O problems apart
/// from corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Page memory or WAL failure. The operation aborts, the caller may
    /// retry after fixing the environment.
    Io,

    /// Invariant violation (missing tail, meta chain loop, unknown page
    /// type/version). Indicates on-disk or in-memory corruption and is
    /// unrecoverable.
    Corrupted,
}

#[derive(Debug)]
pub struct SmallError {
    kind: ErrorKind,
    details: String,
}

impl SmallError {
    pub fn new(msg: &str) -> SmallError {
        SmallError {
            kind: ErrorKind::Io,
            details: msg.to_string(),
        }
    }

    pub fn corrupted(msg: &str) -> SmallError {
        SmallError {
            kind: ErrorKind::Corrupted,
            details: msg.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_corrupted(&self) -> bool {
        self.kind == ErrorKind::Corrupted
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("{:?}: {}\n{:?}", self.kind, self.details, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::new(&e.to_string())
    }
}
