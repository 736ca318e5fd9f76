//! Error taxonomy shared by every session operation.

use thiserror::Error;

/// Errors surfaced by the debug API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebugError {
    /// Malformed caller input: bad address range, out-of-range register
    /// index/count, write to a read-only register set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation requires a stopped thread or a bind that has not been
    /// observed yet.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Nothing to report yet; retry later.
    #[error("not ready")]
    NotReady,

    /// Referenced resource was never bound or is already gone.
    #[error("uninitialized: {0}")]
    Uninitialized(String),

    /// Request is outside what the device or configuration supports.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Kernel refused the debugger connection.
    #[error("insufficient permissions")]
    InsufficientPermissions,

    /// Debugged client tore down before the session became ready.
    #[error("device lost")]
    DeviceLost,

    /// Uncategorized I/O or protocol failure.
    #[error("unknown failure: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, DebugError>;

impl DebugError {
    /// Maps the errno returned by the kernel when opening a debugger
    /// connection.
    pub fn from_open_errno(errno: i32) -> Self {
        match errno {
            libc::ENODEV => DebugError::UnsupportedFeature("no debuggable device".into()),
            libc::EBUSY => DebugError::NotAvailable("debugger already attached".into()),
            libc::EACCES => DebugError::InsufficientPermissions,
            other => DebugError::Unknown(format!("debugger open failed, errno = {other}")),
        }
    }
}
