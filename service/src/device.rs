//! Traits representing the external collaborators of the service: the secure
//! device and its software fallback, client lifetime watching, the monotonic
//! clock and the attestation-ID gatherer.

use crate::error::Error;
use credstore_wire::types::{ErrorCode, KeyCharacteristics, KeyFormat, KeyParam, KeyPurpose};
use std::time::Instant;

/// Result type for secure-device calls.
pub type DeviceResult<T> = Result<T, ErrorCode>;

/// Which of the two process-wide device instances a blob is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// The hardware-backed provider.
    Primary,
    /// The software provider used when hardware refuses a request.
    Fallback,
}

/// Output of a successful device `begin`.
#[derive(Debug, PartialEq)]
pub struct BeginOutput {
    pub handle: u64,
    pub out_params: Vec<KeyParam>,
}

/// Output of a successful device `update`.
#[derive(Debug, PartialEq)]
pub struct UpdateOutput {
    pub input_consumed: usize,
    pub out_params: Vec<KeyParam>,
    pub output: Vec<u8>,
}

/// Output of a successful device `finish`.
#[derive(Debug, PartialEq)]
pub struct FinishOutput {
    pub out_params: Vec<KeyParam>,
    pub output: Vec<u8>,
}

/// The secure-device contract consumed by the service. The underlying driver
/// delivers results through transport callbacks; here each call collapses to
/// a plain function returning the result tuple.
///
/// Every call taking a key blob may fail with
/// [`ErrorCode::KeyRequiresUpgrade`], which obliges the caller to run the
/// blob-upgrade protocol and retry once.
pub trait SecureDevice: Send + Sync {
    fn add_rng_entropy(&self, entropy: &[u8]) -> DeviceResult<()>;

    fn generate_key(&self, params: &[KeyParam]) -> DeviceResult<(Vec<u8>, KeyCharacteristics)>;

    fn import_key(
        &self,
        params: &[KeyParam],
        format: KeyFormat,
        key_data: &[u8],
    ) -> DeviceResult<(Vec<u8>, KeyCharacteristics)>;

    fn get_characteristics(
        &self,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> DeviceResult<KeyCharacteristics>;

    fn export_key(
        &self,
        format: KeyFormat,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> DeviceResult<Vec<u8>>;

    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &[KeyParam],
    ) -> DeviceResult<BeginOutput>;

    fn update(&self, handle: u64, params: &[KeyParam], input: &[u8]) -> DeviceResult<UpdateOutput>;

    fn finish(
        &self,
        handle: u64,
        params: &[KeyParam],
        input: &[u8],
        signature: &[u8],
    ) -> DeviceResult<FinishOutput>;

    fn abort(&self, handle: u64) -> DeviceResult<()>;

    fn attest_key(&self, key_blob: &[u8], params: &[KeyParam]) -> DeviceResult<Vec<Vec<u8>>>;

    fn upgrade_key(&self, key_blob: &[u8], params: &[KeyParam]) -> DeviceResult<Vec<u8>>;

    fn delete_key(&self, key_blob: &[u8]) -> DeviceResult<()>;
}

/// Whether a primary-device failure should be retried against the software
/// fallback. Covers device-busy, the unsupported-request family and absent
/// hardware; other errors are terminal.
pub fn wants_fallback(rc: ErrorCode) -> bool {
    matches!(
        rc,
        ErrorCode::SecureHwBusy
            | ErrorCode::SecureHwCommunicationFailed
            | ErrorCode::HardwareTypeUnavailable
            | ErrorCode::UnsupportedPurpose
            | ErrorCode::UnsupportedAlgorithm
            | ErrorCode::UnsupportedKeySize
            | ErrorCode::UnsupportedBlockMode
            | ErrorCode::UnsupportedMacLength
            | ErrorCode::UnsupportedPaddingMode
            | ErrorCode::UnsupportedDigest
            | ErrorCode::UnsupportedKeyFormat
            | ErrorCode::UnsupportedEcField
            | ErrorCode::UnsupportedEcCurve
            | ErrorCode::UnsupportedKdf
            | ErrorCode::UnsupportedTag
            | ErrorCode::UnsupportedMinMacLength
    )
}

/// An opaque reference to a client process. The transport owns the real
/// lifecycle; the service only learns the client's identity and registers a
/// death callback, so no strong reference cycle forms around the operation
/// map.
pub trait ClientRef: Send + Sync {
    /// Stable identity of the client process.
    fn identity(&self) -> u64;

    /// Arrange for `on_death` to run when the client goes away.
    fn watch(&self, on_death: Box<dyn FnOnce() + Send>);
}

/// Monotonic time source in the clockbase of hardware auth-token timestamps.
pub trait MonotonicClock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Default clock: milliseconds since service start.
pub struct BootClock(Instant);

impl BootClock {
    pub fn new() -> Self {
        BootClock(Instant::now())
    }
}

impl Default for BootClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for BootClock {
    fn now_ms(&self) -> i64 {
        self.0.elapsed().as_millis() as i64
    }
}

/// Supplies the attestation-application-id describing a caller. Gathering it
/// requires platform package information this service does not hold.
pub trait AttestationIdSource: Send + Sync {
    fn attestation_application_id(&self, uid: u32) -> Result<Vec<u8>, Error>;
}
