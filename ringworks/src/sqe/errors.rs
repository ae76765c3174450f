use std::io;

/// A centralized error type for setup, registration and `enter` failures.
///
/// Per-request failures never surface here: they are delivered as negative
/// results in the completion ring.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid ring size: {0} entries (max {1})")]
    InvalidEntries(u32, u32),

    #[error("invalid completion ring size: {cq} entries for {sq} submission entries (max {max})")]
    InvalidCqEntries { sq: u32, cq: u32, max: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller side of the submission ring is out of free slots.
    #[error("submission queue ring is full")]
    SqRingFull,

    #[error("a registered {0} table is already attached")]
    AlreadyRegistered(&'static str),

    #[error("no registered {0} table attached")]
    NotRegistered(&'static str),

    #[error("update of {len} entries at offset {offset} exceeds table size {capacity}")]
    UpdateOutOfRange {
        offset: u32,
        len: usize,
        capacity: usize,
    },

    #[error("bad file descriptor {0}")]
    BadFd(i32),

    #[error("wait for completions was interrupted")]
    Interrupted,

    #[error("timed out waiting for completions")]
    TimedOut,

    #[error("engine is shutting down")]
    ShuttingDown,

    /// The shared ring memory no longer satisfies the cursor invariants. The
    /// engine refuses all further work.
    #[error("FATAL: ring memory invariant violated: {0}")]
    RingCorrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("an unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Positive errno matching the error, as returned by the syscall flavour of
    /// the same interface.
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::InvalidEntries(..)
            | EngineError::InvalidCqEntries { .. }
            | EngineError::InvalidConfig(_)
            | EngineError::UpdateOutOfRange { .. } => libc::EINVAL,
            EngineError::SqRingFull | EngineError::AlreadyRegistered(_) => libc::EBUSY,
            EngineError::NotRegistered(_) | EngineError::ShuttingDown => libc::ENXIO,
            EngineError::BadFd(_) => libc::EBADF,
            EngineError::Interrupted => libc::EINTR,
            EngineError::TimedOut => libc::ETIME,
            EngineError::RingCorrupted(_) => libc::EFAULT,
            EngineError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            EngineError::Other(_) => libc::EIO,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SqRingFull | EngineError::Interrupted | EngineError::TimedOut
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::RingCorrupted(_))
    }
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Other(_), Self::Other(_)) => false,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<EngineError> for io::Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Io(io_err) => io_err,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// Converts an I/O error into a negative completion result.
pub(crate) fn io_result(err: &io::Error) -> i32 {
    // Prefer the raw os error for a direct mapping to errno values.
    if let Some(errno) = err.raw_os_error() {
        return -errno;
    }

    let errno = match err.kind() {
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::Unsupported => libc::EOPNOTSUPP,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        _ => libc::EIO,
    };
    -errno
}
