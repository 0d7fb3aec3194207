//! Provider error types and host errno mapping.

use thiserror::Error;

use crate::lower::LowerError;

/// Host framework error numbers.
pub mod errno {
    /// No such entry.
    pub const ENOENT: i32 = 2;
    /// Resource temporarily unavailable.
    pub const EAGAIN: i32 = 11;
    /// Out of memory.
    pub const ENOMEM: i32 = 12;
    /// Permission denied.
    pub const EACCES: i32 = 13;
    /// Bad address.
    pub const EFAULT: i32 = 14;
    /// Device or resource busy.
    pub const EBUSY: i32 = 16;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Function not implemented.
    pub const ENOSYS: i32 = 38;
    /// No data available.
    pub const ENODATA: i32 = 61;
    /// Message too long.
    pub const EMSGSIZE: i32 = 90;
    /// Operation canceled.
    pub const ECANCELED: i32 = 125;
    /// Connection timed out.
    pub const ETIMEDOUT: i32 = 110;
    /// Remote I/O error.
    pub const EREMOTEIO: i32 = 121;
    /// Endpoint or object in the wrong state for the operation.
    pub const FI_EOPBADSTATE: i32 = 258;
    /// Error completion available.
    pub const FI_EAVAIL: i32 = 259;
    /// Receive buffer too small, message truncated.
    pub const FI_ETRUNC: i32 = 265;
    /// Registration key already in use.
    pub const FI_ENOKEY: i32 = 266;
}

/// Errors returned by provider operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Nothing to report yet, or a bounded resource is exhausted.
    #[error("resource temporarily unavailable")]
    Again,

    /// An allocation failed.
    #[error("out of memory: {reason}")]
    NoMemory {
        /// What could not be allocated.
        reason: String,
    },

    /// Memory region verification failed.
    #[error("access denied for key 0x{key:X}")]
    AccessDenied {
        /// Key presented by the caller.
        key: u64,
    },

    /// Object still referenced.
    #[error("resource busy: {reason}")]
    Busy {
        /// What still holds a reference.
        reason: String,
    },

    /// Invalid argument.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Which argument was rejected and why.
        reason: String,
    },

    /// Operation or command not supported.
    #[error("not supported: {what}")]
    NotSupported {
        /// Unsupported operation.
        what: String,
    },

    /// No wait object attached.
    #[error("no data available")]
    NoData,

    /// Payload exceeds the inject limit.
    #[error("message too long: {len} bytes (max {max})")]
    MessageTooLong {
        /// Requested length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Blocking wait expired.
    #[error("operation timed out")]
    TimedOut,

    /// Unknown handle or key.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// Object is not in a state that allows the operation.
    #[error("bad state: {reason}")]
    BadState {
        /// Why the state is wrong.
        reason: String,
    },

    /// An error completion must be read with readerr first.
    #[error("error completion available")]
    ErrorAvailable,

    /// Requested application key already registered.
    #[error("key 0x{key:X} already registered")]
    KeyInUse {
        /// Duplicate key.
        key: u64,
    },

    /// Error returned verbatim by the lower transport.
    #[error("lower transport: {0}")]
    Transport(#[from] LowerError),
}

impl ProviderError {
    /// Positive host errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            ProviderError::Again => errno::EAGAIN,
            ProviderError::NoMemory { .. } => errno::ENOMEM,
            ProviderError::AccessDenied { .. } => errno::EACCES,
            ProviderError::Busy { .. } => errno::EBUSY,
            ProviderError::InvalidArgument { .. } => errno::EINVAL,
            ProviderError::NotSupported { .. } => errno::ENOSYS,
            ProviderError::NoData => errno::ENODATA,
            ProviderError::MessageTooLong { .. } => errno::EMSGSIZE,
            ProviderError::TimedOut => errno::ETIMEDOUT,
            ProviderError::NotFound { .. } => errno::ENOENT,
            ProviderError::BadState { .. } => errno::FI_EOPBADSTATE,
            ProviderError::ErrorAvailable => errno::FI_EAVAIL,
            ProviderError::KeyInUse { .. } => errno::FI_ENOKEY,
            ProviderError::Transport(e) => e.errno,
        }
    }

    /// Negative return code as seen across the host ABI.
    pub fn retcode(&self) -> i32 {
        -self.errno()
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ProviderError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        ProviderError::Busy {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ProviderError::NotFound { what: what.into() }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        ProviderError::NotSupported { what: what.into() }
    }

    pub(crate) fn bad_state(reason: impl Into<String>) -> Self {
        ProviderError::BadState {
            reason: reason.into(),
        }
    }
}

/// Result alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Static description of a host errno (sign ignored).
pub fn strerror(code: i32) -> &'static str {
    match code.abs() {
        0 => "success",
        errno::ENOENT => "no such entry",
        errno::EAGAIN => "resource temporarily unavailable",
        errno::ENOMEM => "cannot allocate memory",
        errno::EACCES => "permission denied",
        errno::EFAULT => "bad address",
        errno::EBUSY => "device or resource busy",
        errno::EINVAL => "invalid argument",
        errno::ENOSYS => "function not implemented",
        errno::ENODATA => "no data available",
        errno::EMSGSIZE => "message too long",
        errno::ETIMEDOUT => "connection timed out",
        errno::EREMOTEIO => "remote I/O error",
        errno::ECANCELED => "operation canceled",
        errno::FI_EOPBADSTATE => "operation not permitted in current state",
        errno::FI_EAVAIL => "error available",
        errno::FI_ETRUNC => "truncation error",
        errno::FI_ENOKEY => "required key not available",
        _ => "unknown error",
    }
}
