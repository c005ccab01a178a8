//! Key parameters, characteristics, device error codes and the hardware
//! auth-token record.
//!
//! - Enums are exhaustive Rust enums backed by `i32`, with the discriminants
//!   of the wire protocol they mirror.
//! - `KeyParam` is a data-carrying enum used in place of a tag/value struct
//!   pair; [`KeyParam::tag`] recovers the tag for policing.
//! - Everything that the service persists derives `serde` traits; the CBOR
//!   encoding itself is the service's concern.

use crate::{try_from_n, ValueNotRecognized};
use enumn::N;
use serde::{Deserialize, Serialize};

/// Secure-device error codes. Negative values; `Ok` is never surfaced as an
/// error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    UnsupportedPurpose = -2,
    IncompatiblePurpose = -3,
    UnsupportedAlgorithm = -4,
    IncompatibleAlgorithm = -5,
    UnsupportedKeySize = -6,
    UnsupportedBlockMode = -7,
    IncompatibleBlockMode = -8,
    UnsupportedMacLength = -9,
    UnsupportedPaddingMode = -10,
    IncompatiblePaddingMode = -11,
    UnsupportedDigest = -12,
    IncompatibleDigest = -13,
    InvalidExpirationTime = -14,
    InvalidUserId = -15,
    InvalidAuthorizationTimeout = -16,
    UnsupportedKeyFormat = -17,
    IncompatibleKeyFormat = -18,
    InvalidInputLength = -21,
    KeyExportOptionsInvalid = -22,
    DelegationNotAllowed = -23,
    KeyNotYetValid = -24,
    KeyExpired = -25,
    KeyUserNotAuthenticated = -26,
    OutputParameterNull = -27,
    InvalidOperationHandle = -28,
    InsufficientBufferSpace = -29,
    VerificationFailed = -30,
    TooManyOperations = -31,
    UnexpectedNullPointer = -32,
    InvalidKeyBlob = -33,
    ImportedKeyNotEncrypted = -34,
    ImportedKeyDecryptionFailed = -35,
    InvalidArgument = -38,
    UnsupportedTag = -39,
    InvalidTag = -40,
    MemoryAllocationFailed = -41,
    ImportParameterMismatch = -44,
    SecureHwAccessDenied = -45,
    OperationCancelled = -46,
    ConcurrentAccessConflict = -47,
    SecureHwBusy = -48,
    SecureHwCommunicationFailed = -49,
    UnsupportedEcField = -50,
    MissingNonce = -51,
    InvalidNonce = -52,
    MissingMacLength = -53,
    KeyRateLimitExceeded = -54,
    CallerNonceProhibited = -55,
    KeyMaxOpsExceeded = -56,
    InvalidMacLength = -57,
    MissingMinMacLength = -58,
    UnsupportedMinMacLength = -59,
    UnsupportedKdf = -60,
    UnsupportedEcCurve = -61,
    KeyRequiresUpgrade = -62,
    AttestationChallengeMissing = -63,
    KeymasterNotConfigured = -64,
    AttestationApplicationIdMissing = -65,
    CannotAttestIds = -66,
    RollbackResistanceUnavailable = -67,
    HardwareTypeUnavailable = -68,
    UnknownError = -1000,
}
try_from_n!(ErrorCode);

/// What an operation does with a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum KeyPurpose {
    Encrypt = 0,
    Decrypt = 1,
    Sign = 2,
    Verify = 3,
    Derive = 4,
    WrapKey = 5,
}
try_from_n!(KeyPurpose);

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum Algorithm {
    Rsa = 1,
    Ec = 3,
    Aes = 32,
    TripleDes = 33,
    Hmac = 128,
}
try_from_n!(Algorithm);

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum Digest {
    None = 0,
    Md5 = 1,
    Sha1 = 2,
    Sha224 = 3,
    Sha256 = 4,
    Sha384 = 5,
    Sha512 = 6,
}
try_from_n!(Digest);

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum PaddingMode {
    None = 1,
    RsaOaep = 2,
    RsaPss = 3,
    RsaPkcs115Encrypt = 4,
    RsaPkcs115Sign = 5,
    Pkcs7 = 64,
}
try_from_n!(PaddingMode);

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum BlockMode {
    Ecb = 1,
    Cbc = 2,
    Ctr = 3,
    Gcm = 32,
}
try_from_n!(BlockMode);

#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum EcCurve {
    P224 = 0,
    P256 = 1,
    P384 = 2,
    P521 = 3,
}
try_from_n!(EcCurve);

/// Import/export encodings for key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum KeyFormat {
    X509 = 0,
    Pkcs8 = 1,
    Raw = 3,
}
try_from_n!(KeyFormat);

/// Bit positions for the authenticator-type mask carried by auth tokens and
/// by `KeyParam::UserAuthType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N, Serialize, Deserialize)]
#[repr(i32)]
pub enum HardwareAuthenticatorType {
    None = 0,
    Password = 1,
    Fingerprint = 2,
}
try_from_n!(HardwareAuthenticatorType);

/// Authenticator-type mask matching any authenticator.
pub const AUTHENTICATOR_ANY: u32 = u32::MAX;

/// Key size in bits.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeySizeInBits(pub u32);

/// RSA public exponent.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RsaExponent(pub u64);

/// Representation of a wall-clock date/time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateTime {
    pub ms_since_epoch: i64,
}

/// Tags for key parameters, used to police which parameters a client may
/// supply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Purpose,
    Algorithm,
    KeySize,
    BlockMode,
    Digest,
    Padding,
    CallerNonce,
    MinMacLength,
    EcCurve,
    RsaPublicExponent,
    IncludeUniqueId,
    RollbackResistance,
    ActiveDatetime,
    OriginationExpireDatetime,
    UsageExpireDatetime,
    UserSecureId,
    NoAuthRequired,
    UserAuthType,
    AuthTimeout,
    AllowWhileOnBody,
    ApplicationId,
    ApplicationData,
    CreationDatetime,
    AttestationChallenge,
    AttestationApplicationId,
    AttestationIdBrand,
    AttestationIdDevice,
    AttestationIdSerial,
    ResetSinceIdRotation,
    AuthToken,
    Nonce,
    MacLength,
}

/// A single key parameter: a tag together with its value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyParam {
    Purpose(KeyPurpose),
    Algorithm(Algorithm),
    KeySize(KeySizeInBits),
    BlockMode(BlockMode),
    Digest(Digest),
    Padding(PaddingMode),
    CallerNonce,
    MinMacLength(u32),
    EcCurve(EcCurve),
    RsaPublicExponent(RsaExponent),
    IncludeUniqueId,
    RollbackResistance,
    ActiveDatetime(DateTime),
    OriginationExpireDatetime(DateTime),
    UsageExpireDatetime(DateTime),
    UserSecureId(u64),
    NoAuthRequired,
    UserAuthType(u32),
    AuthTimeout(u32),
    AllowWhileOnBody,
    ApplicationId(Vec<u8>),
    ApplicationData(Vec<u8>),
    CreationDatetime(DateTime),
    AttestationChallenge(Vec<u8>),
    AttestationApplicationId(Vec<u8>),
    AttestationIdBrand(Vec<u8>),
    AttestationIdDevice(Vec<u8>),
    AttestationIdSerial(Vec<u8>),
    ResetSinceIdRotation,
    AuthToken(Vec<u8>),
    Nonce(Vec<u8>),
    MacLength(u32),
}

impl KeyParam {
    /// Return the tag identifying this parameter.
    pub fn tag(&self) -> Tag {
        match self {
            KeyParam::Purpose(_) => Tag::Purpose,
            KeyParam::Algorithm(_) => Tag::Algorithm,
            KeyParam::KeySize(_) => Tag::KeySize,
            KeyParam::BlockMode(_) => Tag::BlockMode,
            KeyParam::Digest(_) => Tag::Digest,
            KeyParam::Padding(_) => Tag::Padding,
            KeyParam::CallerNonce => Tag::CallerNonce,
            KeyParam::MinMacLength(_) => Tag::MinMacLength,
            KeyParam::EcCurve(_) => Tag::EcCurve,
            KeyParam::RsaPublicExponent(_) => Tag::RsaPublicExponent,
            KeyParam::IncludeUniqueId => Tag::IncludeUniqueId,
            KeyParam::RollbackResistance => Tag::RollbackResistance,
            KeyParam::ActiveDatetime(_) => Tag::ActiveDatetime,
            KeyParam::OriginationExpireDatetime(_) => Tag::OriginationExpireDatetime,
            KeyParam::UsageExpireDatetime(_) => Tag::UsageExpireDatetime,
            KeyParam::UserSecureId(_) => Tag::UserSecureId,
            KeyParam::NoAuthRequired => Tag::NoAuthRequired,
            KeyParam::UserAuthType(_) => Tag::UserAuthType,
            KeyParam::AuthTimeout(_) => Tag::AuthTimeout,
            KeyParam::AllowWhileOnBody => Tag::AllowWhileOnBody,
            KeyParam::ApplicationId(_) => Tag::ApplicationId,
            KeyParam::ApplicationData(_) => Tag::ApplicationData,
            KeyParam::CreationDatetime(_) => Tag::CreationDatetime,
            KeyParam::AttestationChallenge(_) => Tag::AttestationChallenge,
            KeyParam::AttestationApplicationId(_) => Tag::AttestationApplicationId,
            KeyParam::AttestationIdBrand(_) => Tag::AttestationIdBrand,
            KeyParam::AttestationIdDevice(_) => Tag::AttestationIdDevice,
            KeyParam::AttestationIdSerial(_) => Tag::AttestationIdSerial,
            KeyParam::ResetSinceIdRotation => Tag::ResetSinceIdRotation,
            KeyParam::AuthToken(_) => Tag::AuthToken,
            KeyParam::Nonce(_) => Tag::Nonce,
            KeyParam::MacLength(_) => Tag::MacLength,
        }
    }
}

/// Whether any parameter in `params` carries the given tag.
pub fn contains_tag(params: &[KeyParam], tag: Tag) -> bool {
    params.iter().any(|param| param.tag() == tag)
}

/// The authorization set describing what a key may do, split by which side
/// enforces each parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCharacteristics {
    pub software_enforced: Vec<KeyParam>,
    pub tee_enforced: Vec<KeyParam>,
}

impl KeyCharacteristics {
    /// Both halves of the authorization set, software-enforced first.
    pub fn all(&self) -> Vec<KeyParam> {
        let mut all = self.software_enforced.clone();
        all.extend_from_slice(&self.tee_enforced);
        all
    }
}

/// Serialized size of a [`HardwareAuthToken`]: one version byte, three 64-bit
/// id fields, the 32-bit type mask, the 64-bit timestamp and a 32-byte HMAC.
pub const AUTH_TOKEN_SIZE: usize = 1 + 8 + 8 + 8 + 4 + 8 + 32;

/// Length of the HMAC field of a [`HardwareAuthToken`].
pub const AUTH_TOKEN_MAC_SIZE: usize = 32;

/// A record proving that a user authenticated against a hardware
/// authenticator. Produced and MAC-ed outside this service; the layout is
/// fixed so the device can verify the HMAC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareAuthToken {
    /// Operation handle this token is bound to, or 0 for none.
    pub challenge: i64,
    /// Secure user id the token vouches for.
    pub user_id: i64,
    /// Secure id of the authenticator that produced the token.
    pub authenticator_id: i64,
    /// Bitmask of [`HardwareAuthenticatorType`] values.
    pub authenticator_type: u32,
    /// Monotonic timestamp of the authentication event, in milliseconds.
    pub timestamp_ms: i64,
    /// HMAC over the preceding fields, keyed with the device HMAC key.
    pub mac: Vec<u8>,
}

impl HardwareAuthToken {
    /// Parse the fixed-layout serialization. The version byte must be zero.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ValueNotRecognized> {
        if data.len() != AUTH_TOKEN_SIZE || data[0] != 0 {
            return Err(ValueNotRecognized);
        }
        let i64_le =
            |off: usize| i64::from_le_bytes(data[off..off + 8].try_into().unwrap(/* safe: len checked */));
        Ok(Self {
            challenge: i64_le(1),
            user_id: i64_le(9),
            authenticator_id: i64_le(17),
            authenticator_type: u32::from_be_bytes(
                data[25..29].try_into().unwrap(/* safe: len checked */),
            ),
            timestamp_ms: i64::from_be_bytes(
                data[29..37].try_into().unwrap(/* safe: len checked */),
            ),
            mac: data[37..].to_vec(),
        })
    }

    /// Serialize into the fixed layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.mac_input();
        out.extend_from_slice(&self.mac);
        out
    }

    /// The bytes covered by the token's HMAC: everything except the HMAC
    /// itself.
    pub fn mac_input(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUTH_TOKEN_SIZE);
        out.push(0u8); // version
        out.extend_from_slice(&self.challenge.to_le_bytes());
        out.extend_from_slice(&self.user_id.to_le_bytes());
        out.extend_from_slice(&self.authenticator_id.to_le_bytes());
        out.extend_from_slice(&self.authenticator_type.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out
    }
}
