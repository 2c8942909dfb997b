//! Error handling and stable error codes for radixpool

use crate::types::NodeState;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The pool has no room for another object.
    OutOfSpace { capacity: usize },
    ZeroCapacity,
    /// A pool with this name is already open with different parameters.
    HeaderMismatch,
    NestedTransaction,
    /// Release of an object the pool does not own (or already released).
    UnknownObject,
    IllegalTransition { from: NodeState, to: NodeState },
    RuntimeNotInitialized,
    RuntimeAlreadyInitialized,
    RuntimeStillActive,
    WorkersStillRegistered(usize),
    AlreadyAttached,
    Aborted(String),
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    OutOfSpace = 1,
    ZeroCapacity = 2,
    HeaderMismatch = 3,
    NestedTransaction = 4,
    UnknownObject = 5,
    IllegalTransition = 6,
    RuntimeNotInitialized = 7,
    RuntimeAlreadyInitialized = 8,
    RuntimeStillActive = 9,
    WorkersStillRegistered = 10,
    AlreadyAttached = 11,
    Aborted = 12,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::OutOfSpace => "out_of_space",
            ErrorCode::ZeroCapacity => "zero_capacity",
            ErrorCode::HeaderMismatch => "header_mismatch",
            ErrorCode::NestedTransaction => "nested_transaction",
            ErrorCode::UnknownObject => "unknown_object",
            ErrorCode::IllegalTransition => "illegal_transition",
            ErrorCode::RuntimeNotInitialized => "runtime_not_initialized",
            ErrorCode::RuntimeAlreadyInitialized => "runtime_already_initialized",
            ErrorCode::RuntimeStillActive => "runtime_still_active",
            ErrorCode::WorkersStillRegistered => "workers_still_registered",
            ErrorCode::AlreadyAttached => "already_attached",
            ErrorCode::Aborted => "aborted",
        }
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::OutOfSpace { .. } => ErrorCode::OutOfSpace,
            Error::ZeroCapacity => ErrorCode::ZeroCapacity,
            Error::HeaderMismatch => ErrorCode::HeaderMismatch,
            Error::NestedTransaction => ErrorCode::NestedTransaction,
            Error::UnknownObject => ErrorCode::UnknownObject,
            Error::IllegalTransition { .. } => ErrorCode::IllegalTransition,
            Error::RuntimeNotInitialized => ErrorCode::RuntimeNotInitialized,
            Error::RuntimeAlreadyInitialized => ErrorCode::RuntimeAlreadyInitialized,
            Error::RuntimeStillActive => ErrorCode::RuntimeStillActive,
            Error::WorkersStillRegistered(_) => ErrorCode::WorkersStillRegistered,
            Error::AlreadyAttached => ErrorCode::AlreadyAttached,
            Error::Aborted(_) => ErrorCode::Aborted,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfSpace { capacity } => {
                write!(f, "pool out of space (capacity {capacity} objects)")
            }
            Error::ZeroCapacity => f.write_str("pool capacity must be non-zero"),
            Error::HeaderMismatch => {
                f.write_str("pool already open with a different version or capacity")
            }
            Error::NestedTransaction => {
                f.write_str("transaction already open on this thread")
            }
            Error::UnknownObject => f.write_str("object is not owned by this pool"),
            Error::IllegalTransition { from, to } => {
                write!(f, "illegal node transition {from:?} -> {to:?}")
            }
            Error::RuntimeNotInitialized => f.write_str("runtime_initialize has not been called"),
            Error::RuntimeAlreadyInitialized => f.write_str("runtime is already initialized"),
            Error::RuntimeStillActive => {
                f.write_str("runtime must be finalized before destroying the tree")
            }
            Error::WorkersStillRegistered(n) => {
                write!(f, "{n} worker(s) still registered")
            }
            Error::AlreadyAttached => f.write_str("a tree handle is already attached to this pool"),
            Error::Aborted(msg) => write!(f, "transaction aborted: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Aborted(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Aborted(msg.to_owned())
    }
}
