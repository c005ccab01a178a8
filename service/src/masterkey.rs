//! Per-user master keys and the lock-state machine.
//!
//! Each user has at most one master key: a random AES-256 key wrapped on
//! disk with a key derived from the user's password. The plaintext key is
//! memory-resident only while the user is `Unlocked`, and is what encrypted
//! blob payloads are wrapped with.

use crate::error::Error;
use crate::store::{read_envelope, write_envelope, BlobEnvelope, BlobKind};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use credstore_wire::ResponseCode;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

/// File holding a user's wrapped master key, inside the user's directory.
const MASTER_KEY_FILE: &str = ".masterkey";

const MASTER_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
/// AES-GCM nonce length, shared with the blob store's payload wrapping.
pub(crate) const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 8192;

/// Lock state of one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserLockState {
    /// No master key exists for the user.
    Uninitialized,
    /// A master key exists on disk but is not memory-resident.
    Locked,
    /// The master key is memory-resident.
    Unlocked,
}

impl UserLockState {
    /// The response code reported when an operation needs the user unlocked.
    pub fn as_response(&self) -> ResponseCode {
        match self {
            UserLockState::Uninitialized => ResponseCode::Uninitialized,
            UserLockState::Locked => ResponseCode::Locked,
            UserLockState::Unlocked => ResponseCode::NoError,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MasterKeyFile {
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    wrapped: Vec<u8>,
}

/// Per-user master-key manager.
pub struct MasterKeys {
    root: PathBuf,
    cache: Mutex<HashMap<u32, Zeroizing<Vec<u8>>>>,
}

impl MasterKeys {
    pub fn new(root: &Path) -> Self {
        MasterKeys { root: root.to_path_buf(), cache: Mutex::new(HashMap::new()) }
    }

    fn key_file(&self, user: u32) -> PathBuf {
        self.root.join(format!("user_{}", user)).join(MASTER_KEY_FILE)
    }

    /// Current lock state of `user`.
    pub fn state(&self, user: u32) -> UserLockState {
        if self.cache.lock().unwrap().contains_key(&user) {
            UserLockState::Unlocked
        } else if self.key_file(user).exists() {
            UserLockState::Locked
        } else {
            UserLockState::Uninitialized
        }
    }

    /// Generate a fresh master key for `user`, wrap it with `password` and
    /// persist it. The user becomes `Unlocked`.
    pub fn initialize(&self, user: u32, password: &str) -> Result<(), Error> {
        let mut master = Zeroizing::new(vec![0u8; MASTER_KEY_LEN]);
        OsRng.fill_bytes(&mut master);
        self.write_wrapped(user, password, &master)?;
        self.cache.lock().unwrap().insert(user, master);
        Ok(())
    }

    /// Unwrap the stored master key with `password`. On failure the state
    /// remains `Locked`; an externally managed retry counter advances.
    pub fn unlock(&self, user: u32, password: &str) -> Result<(), Error> {
        let envelope = match read_envelope(&self.key_file(user)) {
            Ok(envelope) if envelope.kind == BlobKind::Master => envelope,
            Ok(_) => return Err(Error::Rc(ResponseCode::ValueCorrupted)),
            Err(Error::Rc(ResponseCode::KeyNotFound)) => {
                return Err(Error::Rc(ResponseCode::Uninitialized));
            }
            Err(e) => return Err(e),
        };
        let file: MasterKeyFile =
            ciborium::de::from_reader(envelope.payload.as_slice()).map_err(|e| {
                log::error!("master key file for user {} unreadable: {}", user, e);
                Error::Rc(ResponseCode::ValueCorrupted)
            })?;
        let kek = derive_password_key(password, &file.salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
        let master = cipher
            .decrypt(Nonce::from_slice(&file.nonce), file.wrapped.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| {
                log::warn!("master key unwrap failed for user {}", user);
                Error::Rc(ResponseCode::ValueCorrupted)
            })?;
        self.cache.lock().unwrap().insert(user, master);
        Ok(())
    }

    /// Drop the memory-resident key; the user becomes `Locked`.
    pub fn lock(&self, user: u32) {
        self.cache.lock().unwrap().remove(&user);
    }

    /// Rewrap the memory-resident master key with a new password. Only valid
    /// while `Unlocked`.
    pub fn rewrap(&self, user: u32, new_password: &str) -> Result<(), Error> {
        let master = self.key_for(user)?;
        self.write_wrapped(user, new_password, &master)
    }

    /// Copy the parent's master-key wrapping byte-for-byte into the new user
    /// slot: the profile shares the parent's password from here on. If the
    /// parent is currently unlocked the child starts unlocked too.
    pub fn copy(&self, parent: u32, user: u32) -> Result<(), Error> {
        let dest = self.key_file(user);
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::copy(self.key_file(parent), &dest)?;
        let mut cache = self.cache.lock().unwrap();
        if let Some(master) = cache.get(&parent).cloned() {
            cache.insert(user, master);
        }
        Ok(())
    }

    /// Forget the user's key material and delete the wrapped key; the user
    /// becomes `Uninitialized`.
    pub fn reset(&self, user: u32) -> Result<(), Error> {
        self.cache.lock().unwrap().remove(&user);
        match std::fs::remove_file(self.key_file(user)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wrap a blob payload with the user's master key. Fails with the user's
    /// lock state when the key is not available.
    pub fn wrap(&self, user: u32, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), Error> {
        let master = self.key_for(user)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::sys())?;
        Ok((nonce, wrapped))
    }

    /// Unwrap a blob payload with the user's master key.
    pub fn unwrap(
        &self,
        user: u32,
        nonce: &[u8; NONCE_LEN],
        wrapped: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let master = self.key_for(user)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master));
        cipher
            .decrypt(Nonce::from_slice(nonce), wrapped)
            .map_err(|_| Error::Rc(ResponseCode::ValueCorrupted))
    }

    fn key_for(&self, user: u32) -> Result<Zeroizing<Vec<u8>>, Error> {
        let cached = self.cache.lock().unwrap().get(&user).cloned();
        match cached {
            Some(master) => Ok(master),
            None => Err(Error::Rc(self.state(user).as_response())),
        }
    }

    fn write_wrapped(
        &self,
        user: u32,
        password: &str,
        master: &[u8],
    ) -> Result<(), Error> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let kek = derive_password_key(password, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
        let wrapped =
            cipher.encrypt(Nonce::from_slice(&nonce), master).map_err(|_| Error::sys())?;

        let mut payload = Vec::new();
        ciborium::ser::into_writer(&MasterKeyFile { salt, nonce, wrapped }, &mut payload)
            .map_err(|_| Error::sys())?;
        let envelope = BlobEnvelope {
            kind: BlobKind::Master,
            flags: Default::default(),
            nonce: None,
            payload,
        };
        write_envelope(&self.key_file(user), &envelope)
    }
}

fn derive_password_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; MASTER_KEY_LEN]> {
    let mut kek = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, kek.as_mut());
    kek
}
