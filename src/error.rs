use thiserror::Error;

#[derive(Error, Debug)]
pub enum UmdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Handle in use: {0}")]
    HandleInUse(String),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Operation timed out")]
    NotReady,

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("Device lost")]
    DeviceLost,

    #[error("Unsupported version: requested {requested_major}.{requested_minor}, supported {supported_major}.x")]
    UnsupportedVersion {
        requested_major: u32,
        requested_minor: u32,
        supported_major: u32,
    },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

/// Numeric result codes reported alongside every API call.
///
/// Values follow the Level-Zero numbering so traces line up with loader logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    NotReady = 1,
    DeviceLost = 0x7000_0001,
    OutOfHostMemory = 0x7000_0002,
    OutOfDeviceMemory = 0x7000_0003,
    UnsupportedVersion = 0x7800_0002,
    NotAvailable = 0x7800_0003,
    InvalidArgument = 0x7800_0004,
    HandleObjectInUse = 0x7800_0006,
    InvalidState = 0x7800_0011,
    Unknown = 0x7fff_fffe,
}

impl UmdError {
    #[must_use]
    pub const fn code(&self) -> ResultCode {
        match self {
            Self::InvalidArgument(_) => ResultCode::InvalidArgument,
            Self::InvalidState(_) => ResultCode::InvalidState,
            Self::HandleInUse(_) => ResultCode::HandleObjectInUse,
            Self::OutOfMemory => ResultCode::OutOfDeviceMemory,
            Self::NotReady => ResultCode::NotReady,
            Self::NotAvailable(_) => ResultCode::NotAvailable,
            Self::DeviceLost => ResultCode::DeviceLost,
            Self::UnsupportedVersion { .. } => ResultCode::UnsupportedVersion,
            Self::Io(_) => ResultCode::Unknown,
        }
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// A handle or reference that no longer names a live object.
    pub(crate) fn stale(kind: &str, what: impl std::fmt::Debug) -> Self {
        Self::InvalidArgument(format!("stale or unknown {kind} {what:?}"))
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn in_use(msg: impl Into<String>) -> Self {
        Self::HandleInUse(msg.into())
    }
}

// A convenient alias
pub type UmdResult<T> = Result<T, UmdError>;
