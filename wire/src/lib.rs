//! Types shared between the credential service, its clients and its
//! secure-device providers.

use enumn::N;
use serde::{Deserialize, Serialize};

pub mod types;
pub use types::*;


/// Sentinel uid meaning "the calling uid" wherever an API method takes an
/// optional target uid.
pub const UID_SELF: i32 = -1;

/// Insertion flag: wrap the blob with the owning user's master key.
pub const FLAG_ENCRYPTED: u32 = 1;

/// Insertion flag: exempt the blob from bulk deletions that would break
/// device encryption. Only system callers may set it.
pub const FLAG_CRITICAL_TO_DEVICE_ENCRYPTION: u32 = 8;

/// Marker type indicating failure to convert a raw value into an `enum`
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueNotRecognized;

/// Macro that emits an implementation of `TryFrom<i32>` for an enum type that
/// has `#[derive(N)]` attached to it.
#[macro_export]
macro_rules! try_from_n {
    { $ename:ident } => {
        impl core::convert::TryFrom<i32> for $ename {
            type Error = $crate::ValueNotRecognized;
            fn try_from(value: i32) -> Result<Self, Self::Error> {
                Self::n(value).ok_or($crate::ValueNotRecognized)
            }
        }
    };
}

/// Service-level response codes. Positive values; `NoError` doubles as the
/// transport-level success indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResponseCode {
    NoError = 1,
    Locked = 2,
    Uninitialized = 3,
    SystemError = 4,
    PermissionDenied = 6,
    KeyNotFound = 7,
    ValueCorrupted = 8,
    OpAuthNeeded = 15,
}
try_from_n!(ResponseCode);
