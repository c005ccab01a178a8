//! Durable per-user blob store and the cross-caller grant table.
//!
//! Layout on disk: one directory per user, one file per blob. Primary blobs
//! live at `<uid>_<alias>`, the characteristics companion of a key at
//! `.<uid>_chr_<alias>`, the user master key at `.masterkey`. Every file is
//! a CBOR envelope carrying the blob kind, its flags, and the payload,
//! wrapped with the user's master key when the flags say so. Writes go to a
//! temporary file first and are renamed into place.

use crate::error::Error;
use crate::masterkey::{MasterKeys, UserLockState, NONCE_LEN};
use credstore_wire::ResponseCode;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Typed persistent units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    /// Opaque caller data.
    Generic,
    /// A user master key (never exposed through blob lookup).
    Master,
    /// An opaque key handle produced by a secure device.
    SecureKey,
    /// Serialized authorization set accompanying a `SecureKey`.
    Characteristics,
}

/// Flags attached to a persisted blob.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobFlags {
    /// Wrapped with the user's master key.
    pub encrypted: bool,
    /// Additionally unreadable in any user state other than `Unlocked`.
    pub super_encrypted: bool,
    /// Exempt from bulk deletions under the system principal.
    pub critical_to_device_encryption: bool,
    /// Produced by the software fallback device rather than hardware.
    pub fallback: bool,
}

impl BlobFlags {
    /// Whether the payload is wrapped with the user master key on disk.
    pub fn wrapped(&self) -> bool {
        self.encrypted || self.super_encrypted
    }
}

/// A typed blob with its plaintext payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub kind: BlobKind,
    pub flags: BlobFlags,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(kind: BlobKind, flags: BlobFlags, data: Vec<u8>) -> Self {
        Blob { kind, flags, data }
    }
}

/// On-disk representation of a blob. `nonce` is present iff the payload is
/// wrapped.
#[derive(Serialize, Deserialize)]
pub(crate) struct BlobEnvelope {
    pub kind: BlobKind,
    pub flags: BlobFlags,
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub payload: Vec<u8>,
}

/// Read an envelope, mapping a missing file to `KeyNotFound` and an
/// undecodable one to `ValueCorrupted`.
pub(crate) fn read_envelope(path: &Path) -> Result<BlobEnvelope, Error> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Rc(ResponseCode::KeyNotFound));
        }
        Err(e) => return Err(e.into()),
    };
    ciborium::de::from_reader(data.as_slice()).map_err(|e| {
        log::error!("undecodable blob file {}: {}", path.display(), e);
        Error::Rc(ResponseCode::ValueCorrupted)
    })
}

/// Write an envelope atomically: temp file in the same directory, then
/// rename over the destination.
pub(crate) fn write_envelope(path: &Path, envelope: &BlobEnvelope) -> Result<(), Error> {
    let mut data = Vec::new();
    ciborium::ser::into_writer(envelope, &mut data).map_err(|_| Error::sys())?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(Error::sys)?;
    let tmp = path.with_file_name(format!(".tmp_{}", file_name.trim_start_matches('.')));
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

struct Grant {
    owner: u32,
    alias: String,
    grantee: u32,
    grant_alias: String,
}

/// The blob store: file-backed blobs plus master keys and grants.
pub struct KeyStore {
    root: PathBuf,
    pub users: MasterKeys,
    grants: Mutex<Vec<Grant>>,
}

impl KeyStore {
    pub fn new(root: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(root)?;
        Ok(KeyStore {
            root: root.to_path_buf(),
            users: MasterKeys::new(root),
            grants: Mutex::new(Vec::new()),
        })
    }

    fn user_dir(&self, user: u32) -> PathBuf {
        self.root.join(format!("user_{}", user))
    }

    fn path_for(&self, uid: u32, alias: &str, kind: BlobKind) -> PathBuf {
        let user = crate::access::get_user_id(uid);
        let name = match kind {
            BlobKind::Characteristics => format!(".{}_chr_{}", uid, escape_alias(alias)),
            _ => format!("{}_{}", uid, escape_alias(alias)),
        };
        self.user_dir(user).join(name)
    }

    /// Atomic replace of the blob stored under `(uid, alias, kind)`. Blobs
    /// flagged for wrapping require the owning user to be `Unlocked`.
    pub fn put(&self, uid: u32, alias: &str, blob: &Blob) -> Result<(), Error> {
        let user = crate::access::get_user_id(uid);
        let (nonce, payload) = if blob.flags.wrapped() {
            let (nonce, wrapped) = self.users.wrap(user, &blob.data)?;
            (Some(nonce), wrapped)
        } else {
            (None, blob.data.clone())
        };
        let envelope = BlobEnvelope { kind: blob.kind, flags: blob.flags, nonce, payload };
        write_envelope(&self.path_for(uid, alias, blob.kind), &envelope)
    }

    /// Fetch and unwrap the blob stored under `(uid, alias)`, requiring it
    /// to have the wanted kind.
    pub fn get(&self, uid: u32, alias: &str, want: BlobKind) -> Result<Blob, Error> {
        let envelope = read_envelope(&self.path_for(uid, alias, want))?;
        if envelope.kind != want {
            return Err(Error::Rc(ResponseCode::KeyNotFound));
        }
        self.open_envelope(uid, envelope)
    }

    /// Fetch the primary blob under `(uid, alias)` whatever its kind.
    pub fn get_any(&self, uid: u32, alias: &str) -> Result<Blob, Error> {
        let envelope = read_envelope(&self.path_for(uid, alias, BlobKind::Generic))?;
        self.open_envelope(uid, envelope)
    }

    fn open_envelope(&self, uid: u32, envelope: BlobEnvelope) -> Result<Blob, Error> {
        let user = crate::access::get_user_id(uid);
        let data = match envelope.nonce {
            Some(nonce) => {
                // Wrapped payload: refuse by lock state before touching key
                // material.
                match self.users.state(user) {
                    UserLockState::Unlocked => {}
                    state => return Err(Error::Rc(state.as_response())),
                }
                self.users.unwrap(user, &nonce, &envelope.payload)?
            }
            None => envelope.payload,
        };
        Ok(Blob { kind: envelope.kind, flags: envelope.flags, data })
    }

    /// Flags of the primary blob, readable in any lock state.
    pub fn flags(&self, uid: u32, alias: &str) -> Result<BlobFlags, Error> {
        Ok(read_envelope(&self.path_for(uid, alias, BlobKind::Generic))?.flags)
    }

    /// Delete the primary blob. Missing entries report `KeyNotFound`.
    pub fn del(&self, uid: u32, alias: &str) -> Result<(), Error> {
        match std::fs::remove_file(self.path_for(uid, alias, BlobKind::Generic)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::Rc(ResponseCode::KeyNotFound))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the characteristics companion; absence is not an error.
    pub fn del_characteristics(&self, uid: u32, alias: &str) -> Result<(), Error> {
        match std::fs::remove_file(self.path_for(uid, alias, BlobKind::Characteristics)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a primary blob exists under `(uid, alias)`.
    pub fn exists(&self, uid: u32, alias: &str) -> bool {
        self.path_for(uid, alias, BlobKind::Generic).exists()
    }

    /// Aliases of `uid`'s primary blobs starting with `prefix`.
    pub fn list(&self, uid: u32, prefix: &str) -> Result<Vec<String>, Error> {
        let dir = self.user_dir(crate::access::get_user_id(uid));
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let marker = format!("{}_", uid);
        let mut aliases = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(escaped) = name.strip_prefix(&marker) {
                let alias = unescape_alias(escaped);
                if alias.starts_with(prefix) {
                    aliases.push(alias);
                }
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    /// Look up a blob on behalf of `uid`, resolving a grant alias to the
    /// granting owner's blob when no direct entry exists.
    pub fn get_key_for_name(&self, uid: u32, alias: &str, want: BlobKind) -> Result<Blob, Error> {
        match self.get(uid, alias, want) {
            Err(Error::Rc(ResponseCode::KeyNotFound)) => match self.resolve_grant(uid, alias) {
                Some((owner, real_alias)) => self.get(owner, &real_alias, want),
                None => Err(Error::Rc(ResponseCode::KeyNotFound)),
            },
            other => other,
        }
    }

    /// Flags of the blob `uid` would see under `alias`, resolving grants.
    pub fn flags_for_name(&self, uid: u32, alias: &str) -> Result<BlobFlags, Error> {
        match self.flags(uid, alias) {
            Err(Error::Rc(ResponseCode::KeyNotFound)) => match self.resolve_grant(uid, alias) {
                Some((owner, real_alias)) => self.flags(owner, &real_alias),
                None => Err(Error::Rc(ResponseCode::KeyNotFound)),
            },
            other => other,
        }
    }

    /// The namespace a lookup by `uid` under `alias` actually lands in: the
    /// uid itself when it owns a blob of that name, else the granting owner.
    pub fn canonical_owner(&self, uid: u32, alias: &str) -> (u32, String) {
        if self.exists(uid, alias) {
            return (uid, alias.to_string());
        }
        self.resolve_grant(uid, alias).unwrap_or((uid, alias.to_string()))
    }

    /// Owner and alias behind a grant alias held by `grantee`, if any.
    pub fn resolve_grant(&self, grantee: u32, grant_alias: &str) -> Option<(u32, String)> {
        self.grants
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.grantee == grantee && g.grant_alias == grant_alias)
            .map(|g| (g.owner, g.alias.clone()))
    }

    /// Record a grant and hand back the opaque alias the grantee will use.
    /// Granting the same blob to the same grantee again returns the existing
    /// alias.
    pub fn add_grant(&self, owner: u32, alias: &str, grantee: u32) -> String {
        let mut grants = self.grants.lock().unwrap();
        if let Some(existing) =
            grants.iter().find(|g| g.owner == owner && g.alias == alias && g.grantee == grantee)
        {
            return existing.grant_alias.clone();
        }
        let grant_alias = format!("ks_grant_{:016x}", OsRng.next_u64());
        grants.push(Grant {
            owner,
            alias: alias.to_string(),
            grantee,
            grant_alias: grant_alias.clone(),
        });
        grant_alias
    }

    /// Remove a grant; reports whether one existed.
    pub fn remove_grant(&self, owner: u32, alias: &str, grantee: u32) -> bool {
        let mut grants = self.grants.lock().unwrap();
        let before = grants.len();
        grants.retain(|g| !(g.owner == owner && g.alias == alias && g.grantee == grantee));
        grants.len() != before
    }

    /// Drop every grant naming `uid` as owner or grantee.
    pub fn remove_grants_for_uid(&self, uid: u32) {
        self.grants.lock().unwrap().retain(|g| g.owner != uid && g.grantee != uid);
    }

    /// Whether `caller` may act on `target`'s namespace: itself, the system
    /// principal, or the holder of an active grant from `target`.
    pub fn is_granted_to(&self, caller: u32, target: u32) -> bool {
        if caller == target || crate::access::is_system(caller) {
            return true;
        }
        self.grants.lock().unwrap().iter().any(|g| g.owner == target && g.grantee == caller)
    }

    /// Delete the user's blobs (all of them, or only the encrypted ones)
    /// along with the master key. Either way the user ends `Uninitialized`.
    pub fn reset_user(&self, user: u32, keep_unencrypted_only: bool) -> Result<(), Error> {
        let dir = self.user_dir(user);
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if keep_unencrypted_only && !should_drop_on_password_reset(&path) {
                        continue;
                    }
                    if let Err(e) = std::fs::remove_file(&path) {
                        log::warn!("reset: failed to remove {}: {}", path.display(), e);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.users.reset(user)
    }

    /// Whether the user owns no blobs (the master key aside).
    pub fn is_empty(&self, user: u32) -> bool {
        match std::fs::read_dir(self.user_dir(user)) {
            Ok(entries) => !entries.flatten().any(|entry| {
                !matches!(
                    read_envelope(&entry.path()),
                    Ok(BlobEnvelope { kind: BlobKind::Master, .. })
                )
            }),
            Err(_) => true,
        }
    }
}

/// A file that must go when the user's password (and with it the master key)
/// is discarded: the master key itself and `encrypted` blobs. Blobs that are
/// only super-encrypted survive, no longer usable but still able to answer
/// characteristics queries from their companion. An undecodable file is
/// dropped too.
fn should_drop_on_password_reset(path: &Path) -> bool {
    match read_envelope(path) {
        Ok(envelope) => envelope.kind == BlobKind::Master || envelope.flags.encrypted,
        Err(_) => true,
    }
}

/// Escape an alias for use as a filename fragment: bytes outside
/// `[A-Za-z0-9_-]` become `+xx`.
fn escape_alias(alias: &str) -> String {
    let mut out = String::with_capacity(alias.len());
    for b in alias.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("+{:02x}", b));
        }
    }
    out
}

fn unescape_alias(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' && i + 3 <= bytes.len() {
            if let Ok(b) = u8::from_str_radix(&escaped[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests;
