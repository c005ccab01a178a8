//! Key-producing and key-reading entry points: generation, import, export,
//! characteristics queries, attestation and the transparent blob-upgrade
//! protocol.

use crate::access::{self, Permission, PERM_ATTEST_DEVICE_IDS};
use crate::device::{wants_fallback, ClientRef};
use crate::error::Error;
use crate::store::{Blob, BlobFlags, BlobKind};
use crate::Service;
use credstore_wire::types::{
    contains_tag, Algorithm, Digest, EcCurve, ErrorCode, KeyCharacteristics, KeyFormat, KeyParam,
    KeyPurpose, PaddingMode, Tag,
};
use credstore_wire::{
    ResponseCode, FLAG_CRITICAL_TO_DEVICE_ENCRYPTION, FLAG_ENCRYPTED, UID_SELF,
};
use log::{info, warn};

/// Maximum size of the attestation-application-id parameter; longer values
/// are truncated.
const MAX_ATTESTATION_APP_ID_SIZE: usize = 1024;

/// Window after a factory reset during which attestations carry the
/// reset-since-id-rotation marker: thirty days.
const ID_ROTATION_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

/// Answer to a characteristics query.
#[derive(Debug, PartialEq, Eq)]
pub enum Characteristics {
    /// Live characteristics fetched from the device.
    Fresh(KeyCharacteristics),
    /// The master key is gone, so only the set cached at creation time is
    /// available; the hardware-enforced half is unknown.
    Stale(KeyCharacteristics),
}

impl Characteristics {
    pub fn into_inner(self) -> KeyCharacteristics {
        match self {
            Characteristics::Fresh(chars) | Characteristics::Stale(chars) => chars,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Characteristics::Stale(_))
    }
}

/// A key is authentication-bound unless it explicitly opts out.
fn is_authentication_bound(params: &[KeyParam]) -> bool {
    !contains_tag(params, Tag::NoAuthRequired)
}

impl Service {
    /// Generate a key on the secure device and persist the resulting blob
    /// under the caller's (or target's) namespace.
    pub fn generate_key(
        &self,
        caller: u32,
        alias: &str,
        params: &[KeyParam],
        entropy: &[u8],
        uid: i32,
        flags: u32,
    ) -> Result<KeyCharacteristics, Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_and_state(
            caller,
            Permission::Insert,
            target,
            flags & FLAG_ENCRYPTED != 0,
        )?;
        let critical = flags & FLAG_CRITICAL_TO_DEVICE_ENCRYPTION != 0;
        if critical && !access::is_system(target) {
            warn!("non-system uid {} cannot mark keys critical to device encryption", target);
            return Err(Error::perm());
        }
        if contains_tag(params, Tag::IncludeUniqueId)
            && !self.policy.has_permission(caller, Permission::GenUniqueId)
        {
            return Err(Error::perm());
        }

        if !entropy.is_empty() {
            self.primary.add_rng_entropy(entropy).map_err(Error::Km)?;
        }

        let mut used_fallback = false;
        let (key_blob, characteristics) = match self.primary.generate_key(params) {
            Ok(created) => created,
            Err(rc) if wants_fallback(rc) => {
                warn!("generate_key failed with {:?}, retrying on fallback device", rc);
                used_fallback = true;
                self.fallback.generate_key(params).map_err(Error::Km)?
            }
            Err(rc) => return Err(Error::Km(rc)),
        };

        self.persist_new_key(target, alias, params, flags, used_fallback, key_blob)?;
        Ok(characteristics)
    }

    /// Import caller-supplied key material. Identical to generation apart
    /// from the device call.
    #[allow(clippy::too_many_arguments)]
    pub fn import_key(
        &self,
        caller: u32,
        alias: &str,
        params: &[KeyParam],
        format: KeyFormat,
        key_data: &[u8],
        uid: i32,
        flags: u32,
    ) -> Result<KeyCharacteristics, Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_and_state(
            caller,
            Permission::Insert,
            target,
            flags & FLAG_ENCRYPTED != 0,
        )?;
        let critical = flags & FLAG_CRITICAL_TO_DEVICE_ENCRYPTION != 0;
        if critical && !access::is_system(target) {
            warn!("non-system uid {} cannot mark keys critical to device encryption", target);
            return Err(Error::perm());
        }

        let mut used_fallback = false;
        let (key_blob, characteristics) = match self.primary.import_key(params, format, key_data)
        {
            Ok(created) => created,
            Err(rc) if wants_fallback(rc) => {
                warn!("import_key failed with {:?}, retrying on fallback device", rc);
                used_fallback = true;
                self.fallback.import_key(params, format, key_data).map_err(Error::Km)?
            }
            Err(rc) => return Err(Error::Km(rc)),
        };

        self.persist_new_key(target, alias, params, flags, used_fallback, key_blob)?;
        Ok(characteristics)
    }

    /// Write the key blob and its characteristics companion. Both land on
    /// disk or neither does.
    fn persist_new_key(
        &self,
        target: u32,
        alias: &str,
        params: &[KeyParam],
        flags: u32,
        used_fallback: bool,
        key_blob: Vec<u8>,
    ) -> Result<(), Error> {
        let critical = flags & FLAG_CRITICAL_TO_DEVICE_ENCRYPTION != 0;
        let blob_flags = BlobFlags {
            encrypted: flags & FLAG_ENCRYPTED != 0,
            super_encrypted: is_authentication_bound(params) && !critical,
            critical_to_device_encryption: critical,
            fallback: used_fallback,
        };
        self.store.put(target, alias, &Blob::new(BlobKind::SecureKey, blob_flags, key_blob))?;

        let mut serialized = Vec::new();
        if ciborium::ser::into_writer(&params.to_vec(), &mut serialized).is_err() {
            let _ = self.store.del(target, alias);
            return Err(Error::sys());
        }
        let chr_flags = BlobFlags {
            encrypted: flags & FLAG_ENCRYPTED != 0,
            fallback: used_fallback,
            ..Default::default()
        };
        let companion = Blob::new(BlobKind::Characteristics, chr_flags, serialized);
        if let Err(e) = self.store.put(target, alias, &companion) {
            // Key without companion violates the pairing invariant; back out.
            let _ = self.store.del(target, alias);
            return Err(e);
        }
        Ok(())
    }

    /// Fetch a key's authorization set. When the master key is absent the
    /// cached creation-time set is served instead, marked stale.
    pub fn get_characteristics(
        &self,
        caller: u32,
        alias: &str,
        client_id: &[u8],
        app_data: &[u8],
        uid: i32,
    ) -> Result<Characteristics, Error> {
        let target = access::effective_uid(caller, uid);
        if !self.store.is_granted_to(caller, target) {
            warn!("uid {} not permitted to act for uid {} in get_characteristics", caller, target);
            return Err(Error::perm());
        }

        let key_blob = match self.store.get_key_for_name(target, alias, BlobKind::SecureKey) {
            Ok(blob) => blob,
            Err(Error::Rc(ResponseCode::Uninitialized)) => {
                // Auth-bound keys outlive their master key when the lock
                // screen is removed; their cached characteristics remain
                // answerable.
                let chars = self.persisted_characteristics_checked(target, alias)?;
                return Ok(Characteristics::Stale(KeyCharacteristics {
                    software_enforced: chars,
                    tee_enforced: Vec::new(),
                }));
            }
            Err(e) => return Err(e),
        };

        let device = self.device_of_flags(key_blob.flags);
        match device.get_characteristics(&key_blob.data, client_id, app_data) {
            Ok(chars) => Ok(Characteristics::Fresh(chars)),
            Err(ErrorCode::KeyRequiresUpgrade) => {
                let upgrade_params = app_params(client_id, app_data);
                let upgraded = self.upgrade_key_blob(target, alias, &upgrade_params)?;
                device
                    .get_characteristics(&upgraded.data, client_id, app_data)
                    .map(Characteristics::Fresh)
                    .map_err(Error::Km)
            }
            Err(rc) => Err(Error::Km(rc)),
        }
    }

    /// Export key material in the requested format.
    pub fn export_key(
        &self,
        caller: u32,
        alias: &str,
        format: KeyFormat,
        client_id: &[u8],
        app_data: &[u8],
        uid: i32,
    ) -> Result<Vec<u8>, Error> {
        let target = access::effective_uid(caller, uid);
        if !self.store.is_granted_to(caller, target) {
            warn!("uid {} not permitted to act for uid {} in export_key", caller, target);
            return Err(Error::perm());
        }
        let key_blob = self.store.get_key_for_name(target, alias, BlobKind::SecureKey)?;
        let device = self.device_of_flags(key_blob.flags);
        match device.export_key(format, &key_blob.data, client_id, app_data) {
            Err(ErrorCode::KeyRequiresUpgrade) => {
                let upgrade_params = app_params(client_id, app_data);
                let upgraded = self.upgrade_key_blob(target, alias, &upgrade_params)?;
                device
                    .export_key(format, &upgraded.data, client_id, app_data)
                    .map_err(Error::Km)
            }
            other => other.map_err(Error::Km),
        }
    }

    /// Attest to a stored key. Device-id attestation has a dedicated entry
    /// point and is rejected here.
    pub fn attest_key(
        &self,
        caller: u32,
        alias: &str,
        params: &[KeyParam],
    ) -> Result<Vec<Vec<u8>>, Error> {
        crate::check_client_params(params)?;
        if is_device_id_attestation_requested(params) {
            return Err(Error::Km(ErrorCode::InvalidArgument));
        }
        let mut attest_params = params.to_vec();
        self.update_params_for_attestation(caller, &mut attest_params)?;

        let key_blob = self.store.get_key_for_name(caller, alias, BlobKind::SecureKey)?;
        self.device_of_flags(key_blob.flags)
            .attest_key(&key_blob.data, &attest_params)
            .map_err(Error::Km)
    }

    /// Attest to the device's identifiers with a throwaway key. The
    /// ephemeral key is deleted whether or not attestation succeeded.
    pub fn attest_device_ids(
        &self,
        caller: u32,
        params: &[KeyParam],
    ) -> Result<Vec<Vec<u8>>, Error> {
        crate::check_client_params(params)?;
        if !is_device_id_attestation_requested(params) {
            return Err(Error::Km(ErrorCode::InvalidArgument));
        }
        if !self.policy.has_platform_permission(caller, PERM_ATTEST_DEVICE_IDS) {
            warn!("uid {} denied device-id attestation", caller);
            return Err(Error::Km(ErrorCode::CannotAttestIds));
        }
        let mut attest_params = params.to_vec();
        self.update_params_for_attestation(caller, &mut attest_params)?;

        let ephemeral_params = [
            KeyParam::Purpose(KeyPurpose::Verify),
            KeyParam::Algorithm(Algorithm::Ec),
            KeyParam::Digest(Digest::Sha256),
            KeyParam::NoAuthRequired,
            KeyParam::EcCurve(EcCurve::P256),
        ];
        let (ephemeral_blob, _) =
            self.primary.generate_key(&ephemeral_params).map_err(Error::Km)?;

        let attestation = self.primary.attest_key(&ephemeral_blob, &attest_params);
        let deletion = self.primary.delete_key(&ephemeral_blob);

        let chain = attestation.map_err(Error::Km)?;
        deletion.map_err(Error::Km)?;
        Ok(chain)
    }

    /// One-shot signing over an internally managed operation.
    pub fn sign(
        &self,
        caller: u32,
        client: &dyn ClientRef,
        alias: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.check_permission(caller, Permission::Sign)?;
        self.one_shot(caller, client, alias, KeyPurpose::Sign, data, &[])
    }

    /// One-shot verification over an internally managed operation.
    pub fn verify(
        &self,
        caller: u32,
        client: &dyn ClientRef,
        alias: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        self.check_permission(caller, Permission::Verify)?;
        self.one_shot(caller, client, alias, KeyPurpose::Verify, data, signature).map(|_| ())
    }

    /// Compose begin/update/finish for the legacy one-shot paths. Keys from
    /// that era are digest-none/padding-none.
    fn one_shot(
        &self,
        caller: u32,
        client: &dyn ClientRef,
        alias: &str,
        purpose: KeyPurpose,
        data: &[u8],
        signature: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut in_params =
            vec![KeyParam::Digest(Digest::None), KeyParam::Padding(PaddingMode::None)];
        if let Ok(chars) = self.get_characteristics(caller, alias, &[], &[], UID_SELF) {
            let algorithm = chars
                .into_inner()
                .all()
                .iter()
                .find_map(|p| if let KeyParam::Algorithm(a) = p { Some(*a) } else { None });
            match algorithm {
                Some(a) => in_params.push(KeyParam::Algorithm(a)),
                None => warn!("stored characteristics carry no algorithm for {}", alias),
            }
        }

        let begun =
            self.begin(caller, client, alias, purpose, true, &in_params, &[], UID_SELF)?;
        let mut output = Vec::new();
        let mut consumed = 0usize;
        while consumed < data.len() {
            let chunk = match self.update(begun.token, &[], &data[consumed..]) {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = self.abort(begun.token);
                    return Err(e);
                }
            };
            if chunk.input_consumed == 0 {
                warn!("device consumed no input; aborting one-shot operation");
                let _ = self.abort(begun.token);
                return Err(Error::sys());
            }
            consumed += chunk.input_consumed;
            output.extend_from_slice(&chunk.output);
        }
        let finished = self.finish(begun.token, &[], signature, &[])?;
        output.extend_from_slice(&finished.output);
        Ok(output)
    }

    /// Run the upgrade protocol on a stored blob: ask the device for a new
    /// blob, swap it in preserving flags, and re-read it for the caller.
    pub(crate) fn upgrade_key_blob(
        &self,
        uid: u32,
        alias: &str,
        params: &[KeyParam],
    ) -> Result<Blob, Error> {
        // Re-read rather than trusting any caller-held copy.
        let (owner, owned_alias) = self.store.canonical_owner(uid, alias);
        let blob = self.store.get(owner, &owned_alias, BlobKind::SecureKey)?;
        info!("upgrading key blob {} of uid {}", owned_alias, owner);

        let device = self.device_of_flags(blob.flags);
        let new_data = device.upgrade_key(&blob.data, params).map_err(Error::Km)?;

        self.store.del(owner, &owned_alias)?;
        self.store.put(
            owner,
            &owned_alias,
            &Blob::new(BlobKind::SecureKey, blob.flags, new_data),
        )?;
        self.store.get(owner, &owned_alias, BlobKind::SecureKey)
    }

    /// The creation-time parameter set cached beside a key, or empty when
    /// unreadable.
    pub(crate) fn persisted_characteristics(&self, uid: u32, alias: &str) -> Vec<KeyParam> {
        match self.persisted_characteristics_checked(uid, alias) {
            Ok(params) => params,
            Err(_) => {
                log::debug!("no cached characteristics for {}", alias);
                Vec::new()
            }
        }
    }

    fn persisted_characteristics_checked(
        &self,
        uid: u32,
        alias: &str,
    ) -> Result<Vec<KeyParam>, Error> {
        let blob = self.store.get_key_for_name(uid, alias, BlobKind::Characteristics)?;
        ciborium::de::from_reader(blob.data.as_slice())
            .map_err(|_| Error::Rc(ResponseCode::ValueCorrupted))
    }

    /// Enrich attestation parameters with the application id of the caller
    /// and the reset-window marker.
    fn update_params_for_attestation(
        &self,
        caller: u32,
        params: &mut Vec<KeyParam>,
    ) -> Result<(), Error> {
        if self.had_factory_reset_since_id_rotation()? {
            params.push(KeyParam::ResetSinceIdRotation);
        }
        let mut app_id = self
            .attest_ids
            .attestation_application_id(caller)
            .map_err(|_| Error::Km(ErrorCode::AttestationApplicationIdMissing))?;
        if app_id.len() > MAX_ATTESTATION_APP_ID_SIZE {
            app_id.truncate(MAX_ATTESTATION_APP_ID_SIZE);
        }
        params.push(KeyParam::AttestationApplicationId(app_id));
        Ok(())
    }

    /// Whether the device was factory-reset within the id-rotation window.
    /// The `timestamp` file's change time anchors the window; a missing file
    /// is created and counts as a fresh reset.
    fn had_factory_reset_since_id_rotation(&self) -> Result<bool, Error> {
        match std::fs::metadata(&self.timestamp_file) {
            Ok(metadata) => {
                #[cfg(unix)]
                let anchor = std::os::unix::fs::MetadataExt::ctime(&metadata);
                #[cfg(not(unix))]
                let anchor = metadata
                    .modified()?
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_err(|_| Error::sys())?
                    .as_secs() as i64;
                let now = crate::wall_ms() / 1000;
                Ok(now - anchor < ID_ROTATION_PERIOD_SECS)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                create_timestamp_file(&self.timestamp_file)?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn app_params(client_id: &[u8], app_data: &[u8]) -> Vec<KeyParam> {
    let mut params = Vec::new();
    if !client_id.is_empty() {
        params.push(KeyParam::ApplicationId(client_id.to_vec()));
    }
    if !app_data.is_empty() {
        params.push(KeyParam::ApplicationData(app_data.to_vec()));
    }
    params
}

fn is_device_id_attestation_requested(params: &[KeyParam]) -> bool {
    params.iter().any(|p| {
        matches!(
            p.tag(),
            Tag::AttestationIdBrand | Tag::AttestationIdDevice | Tag::AttestationIdSerial
        )
    })
}

fn create_timestamp_file(path: &std::path::Path) -> Result<(), Error> {
    use std::fs::OpenOptions;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)?;
    Ok(())
}
