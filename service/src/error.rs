//! Service error type spanning the two halves of the status-code space.

use credstore_wire::{types::ErrorCode, ResponseCode};

/// Everything an entry point can fail with: a service-level response code or
/// a secure-device error code. I/O and serialization failures are collapsed
/// into [`ResponseCode::SystemError`] at the point where they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Service-level response code.
    #[error("response code {0:?}")]
    Rc(ResponseCode),
    /// Secure-device error code.
    #[error("device error {0:?}")]
    Km(ErrorCode),
}

impl Error {
    /// Shorthand for the generic system error.
    pub fn sys() -> Self {
        Error::Rc(ResponseCode::SystemError)
    }

    /// Shorthand for a permission denial.
    pub fn perm() -> Self {
        Error::Rc(ResponseCode::PermissionDenied)
    }

    /// The numeric status conveyed to clients: positive for service codes,
    /// negative for device codes.
    pub fn code(&self) -> i32 {
        match self {
            Error::Rc(rc) => *rc as i32,
            Error::Km(ec) => *ec as i32,
        }
    }
}

impl From<ResponseCode> for Error {
    fn from(rc: ResponseCode) -> Self {
        Error::Rc(rc)
    }
}

impl From<ErrorCode> for Error {
    fn from(ec: ErrorCode) -> Self {
        Error::Km(ec)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        log::error!("storage I/O failure: {}", e);
        Error::sys()
    }
}
