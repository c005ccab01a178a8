//! Multi-user credential service core.
//!
//! A long-lived daemon mediating between client applications and a
//! hardware-backed key provider: it persists opaque key blobs per caller,
//! enforces access control and key authorization policy, tracks in-flight
//! cryptographic operations, and binds operations to fresh user
//! authentication evidence. The IPC transport, the secure-device driver,
//! the platform permission database and the attestation-ID gatherer are
//! external collaborators injected as trait objects.

use std::path::PathBuf;
use std::sync::Arc;

use credstore_wire::types::{ErrorCode, HardwareAuthToken, KeyParam};
use credstore_wire::{ResponseCode, FLAG_ENCRYPTED};
use log::{info, warn};

pub mod access;
pub mod authtoken;
pub mod device;
mod enforcement;
pub mod error;
mod keys;
mod masterkey;
mod operation;
pub mod store;


pub use error::Error;
pub use keys::Characteristics;
pub use masterkey::UserLockState;
pub use operation::{BeginResult, OpToken};

use access::Permission;
use authtoken::AuthTokenTable;
use device::{AttestationIdSource, ClientRef, DeviceKind, MonotonicClock, SecureDevice};
use operation::OperationMap;
use store::{Blob, BlobFlags, BlobKind, KeyStore};

/// Startup configuration: where the service keeps its state.
pub struct ServiceConfig {
    /// Directory holding per-user blob directories and the `timestamp`
    /// file.
    pub root: PathBuf,
}

/// The credential service. One instance per daemon, constructed at startup
/// and shared by every request-handler thread.
pub struct Service {
    pub(crate) store: KeyStore,
    pub(crate) operations: OperationMap,
    pub(crate) auth_tokens: AuthTokenTable,
    pub(crate) primary: Arc<dyn SecureDevice>,
    pub(crate) fallback: Arc<dyn SecureDevice>,
    pub(crate) policy: Arc<dyn access::PermissionPolicy>,
    pub(crate) attest_ids: Arc<dyn AttestationIdSource>,
    pub(crate) clock: Arc<dyn MonotonicClock>,
    pub(crate) timestamp_file: PathBuf,
}

impl Service {
    pub fn new(
        config: ServiceConfig,
        primary: Arc<dyn SecureDevice>,
        fallback: Arc<dyn SecureDevice>,
        policy: Arc<dyn access::PermissionPolicy>,
        attest_ids: Arc<dyn AttestationIdSource>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Result<Self, Error> {
        let store = KeyStore::new(&config.root)?;
        Ok(Service {
            store,
            operations: OperationMap::new(),
            auth_tokens: AuthTokenTable::new(),
            primary,
            fallback,
            policy,
            attest_ids,
            clock,
            timestamp_file: config.root.join("timestamp"),
        })
    }

    /// Wire a client's death notification to the abort sweep. Only a weak
    /// reference crosses into the callback, so the operation map never keeps
    /// the service alive through its clients.
    pub fn watch_client(service: &Arc<Service>, client: &dyn ClientRef) {
        let weak = Arc::downgrade(service);
        let identity = client.identity();
        client.watch(Box::new(move || {
            if let Some(service) = weak.upgrade() {
                service.client_died(identity);
            }
        }));
    }

    /*
     * ACL gates. Every entry point funnels through one of these before it
     * touches storage or the device.
     */

    pub(crate) fn check_permission(&self, caller: u32, perm: Permission) -> Result<(), Error> {
        if self.policy.has_permission(caller, perm) {
            Ok(())
        } else {
            warn!("permission {:?} denied for uid {}", perm, caller);
            Err(Error::perm())
        }
    }

    fn check_permission_target(
        &self,
        caller: u32,
        perm: Permission,
        target: u32,
    ) -> Result<(), Error> {
        self.check_permission(caller, perm)?;
        if self.store.is_granted_to(caller, target) {
            Ok(())
        } else {
            warn!("uid {} not granted to act for uid {}", caller, target);
            Err(Error::perm())
        }
    }

    pub(crate) fn check_permission_and_state(
        &self,
        caller: u32,
        perm: Permission,
        target: u32,
        check_unlocked: bool,
    ) -> Result<(), Error> {
        self.check_permission_target(caller, perm, target)?;
        if check_unlocked {
            let state = self.store.users.state(access::get_user_id(target));
            if state != UserLockState::Unlocked {
                return Err(Error::Rc(state.as_response()));
            }
        }
        Ok(())
    }

    fn check_permission_self_or_system(
        &self,
        caller: u32,
        perm: Permission,
        target: u32,
    ) -> Result<(), Error> {
        self.check_permission(caller, perm)?;
        if target == caller || access::is_system(caller) {
            Ok(())
        } else {
            Err(Error::perm())
        }
    }

    pub(crate) fn device_of(&self, kind: DeviceKind) -> &Arc<dyn SecureDevice> {
        match kind {
            DeviceKind::Primary => &self.primary,
            DeviceKind::Fallback => &self.fallback,
        }
    }

    pub(crate) fn device_of_flags(&self, flags: BlobFlags) -> &Arc<dyn SecureDevice> {
        self.device_of(operation::device_kind(flags))
    }

    /*
     * Simple entry points over the blob store and user state.
     */

    /// Lock state of a user.
    pub fn get_state(&self, caller: u32, user: u32) -> Result<UserLockState, Error> {
        self.check_permission(caller, Permission::GetState)?;
        Ok(self.store.users.state(user))
    }

    /// Fetch a generic blob.
    pub fn get(&self, caller: u32, alias: &str, uid: i32) -> Result<Vec<u8>, Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_target(caller, Permission::Get, target)?;
        Ok(self.store.get_key_for_name(target, alias, BlobKind::Generic)?.data)
    }

    /// Store a generic blob.
    pub fn insert(
        &self,
        caller: u32,
        alias: &str,
        item: &[u8],
        uid: i32,
        flags: u32,
    ) -> Result<(), Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_and_state(
            caller,
            Permission::Insert,
            target,
            flags & FLAG_ENCRYPTED != 0,
        )?;
        let blob_flags = BlobFlags { encrypted: flags & FLAG_ENCRYPTED != 0, ..Default::default() };
        self.store.put(target, alias, &Blob::new(BlobKind::Generic, blob_flags, item.to_vec()))
    }

    /// Delete a blob and its characteristics companion.
    pub fn del(&self, caller: u32, alias: &str, uid: i32) -> Result<(), Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_target(caller, Permission::Delete, target)?;
        info!("del {} {}", alias, target);
        self.store.del(target, alias)?;
        self.store.del_characteristics(target, alias)
    }

    /// Whether a blob exists.
    pub fn exist(&self, caller: u32, alias: &str, uid: i32) -> Result<bool, Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_target(caller, Permission::Exist, target)?;
        Ok(self.store.exists(target, alias))
    }

    /// Aliases with the given prefix.
    pub fn list(&self, caller: u32, prefix: &str, uid: i32) -> Result<Vec<String>, Error> {
        let target = access::effective_uid(caller, uid);
        self.check_permission_target(caller, Permission::List, target)?;
        self.store.list(target, prefix)
    }

    /// Drop everything owned by the calling user.
    pub fn reset(&self, caller: u32) -> Result<(), Error> {
        self.check_permission(caller, Permission::Reset)?;
        self.store.reset_user(access::get_user_id(caller), false)
    }

    /*
     * User lifecycle.
     */

    /// React to a password change: initialize, rewrap or reset the user's
    /// master key, depending on state and on whether the password was
    /// removed.
    pub fn on_user_password_changed(
        &self,
        caller: u32,
        user: u32,
        password: &str,
    ) -> Result<(), Error> {
        self.check_permission(caller, Permission::Password)?;
        // Flush cached tokens so none outlives the credential that minted
        // it.
        self.auth_tokens.clear();

        if password.is_empty() {
            info!("secure lock screen for user {} removed, dropping encrypted entries", user);
            return self.store.reset_user(user, true);
        }
        match self.store.users.state(user) {
            UserLockState::Uninitialized => self.store.users.initialize(user, password),
            UserLockState::Unlocked => self.store.users.rewrap(user, password),
            UserLockState::Locked => {
                warn!("changing user {}'s password while locked, dropping old entries", user);
                self.store.reset_user(user, true)?;
                self.store.users.initialize(user, password)
            }
        }
    }

    /// A user was added. With a parent given, the new profile shares the
    /// parent's master key (and so its password) forever; the parent's
    /// password is not available here.
    pub fn on_user_added(&self, caller: u32, user: u32, parent: Option<u32>) -> Result<(), Error> {
        self.check_permission(caller, Permission::UserChanged)?;
        if !self.store.is_empty(user) {
            warn!("new user {}'s store is not empty, clearing old entries", user);
        }
        self.store.reset_user(user, false)?;
        match parent {
            Some(parent) => self.store.users.copy(parent, user),
            None => Ok(()),
        }
    }

    /// A user was removed; drop everything it owned.
    pub fn on_user_removed(&self, caller: u32, user: u32) -> Result<(), Error> {
        self.check_permission(caller, Permission::UserChanged)?;
        self.store.reset_user(user, false)
    }

    /// Discard the user's in-memory master key.
    pub fn lock(&self, caller: u32, user: u32) -> Result<(), Error> {
        self.check_permission(caller, Permission::Lock)?;
        let state = self.store.users.state(user);
        if state != UserLockState::Unlocked {
            info!("lock called in state {:?}", state);
            return Err(Error::Rc(state.as_response()));
        }
        self.store.users.lock(user);
        Ok(())
    }

    /// Unwrap the user's master key with the given password.
    pub fn unlock(&self, caller: u32, user: u32, password: &str) -> Result<(), Error> {
        self.check_permission(caller, Permission::Unlock)?;
        match self.store.users.state(user) {
            UserLockState::Locked => self.store.users.unlock(user, password),
            UserLockState::Unlocked => {
                info!("unlock called when already unlocked, ignoring");
                Ok(())
            }
            UserLockState::Uninitialized => {
                warn!("unlock called on uninitialized user {}", user);
                Err(Error::Rc(ResponseCode::Uninitialized))
            }
        }
    }

    /// Whether the user owns no blobs.
    pub fn is_empty(&self, caller: u32, user: u32) -> Result<bool, Error> {
        self.check_permission(caller, Permission::IsEmpty)?;
        Ok(self.store.is_empty(user))
    }

    /*
     * Grants and bulk removal.
     */

    /// Grant `grantee` access to the caller's blob, returning the opaque
    /// alias the grantee uses from now on.
    pub fn grant(&self, caller: u32, alias: &str, grantee: u32) -> Result<String, Error> {
        self.check_permission_and_state(caller, Permission::Grant, caller, true)?;
        if !self.store.exists(caller, alias) {
            return Err(Error::Rc(ResponseCode::KeyNotFound));
        }
        Ok(self.store.add_grant(caller, alias, grantee))
    }

    /// Withdraw a grant.
    pub fn ungrant(&self, caller: u32, alias: &str, grantee: u32) -> Result<(), Error> {
        self.check_permission_and_state(caller, Permission::Grant, caller, true)?;
        if !self.store.exists(caller, alias) {
            return Err(Error::Rc(ResponseCode::KeyNotFound));
        }
        if self.store.remove_grant(caller, alias, grantee) {
            Ok(())
        } else {
            Err(Error::Rc(ResponseCode::KeyNotFound))
        }
    }

    /// Copy a blob to another alias/namespace. Documented legacy surface:
    /// no current caller depends on it, and it may be removed without
    /// compatibility impact. Characteristics companions are deliberately
    /// not copied.
    pub fn duplicate(
        &self,
        caller: u32,
        src_alias: &str,
        src_uid: i32,
        dest_alias: &str,
        dest_uid: i32,
    ) -> Result<(), Error> {
        self.check_permission(caller, Permission::Duplicate)?;
        let state = self.store.users.state(access::get_user_id(caller));
        if state != UserLockState::Unlocked {
            return Err(Error::Rc(state.as_response()));
        }

        let src = access::effective_uid(caller, src_uid);
        if src != caller && !self.store.is_granted_to(caller, src) {
            return Err(Error::perm());
        }
        let dest = access::effective_uid(caller, dest_uid);
        if src != dest {
            if src != caller {
                warn!("can only duplicate from the caller to another uid");
                return Err(Error::perm());
            }
            if !self.store.is_granted_to(caller, dest) {
                return Err(Error::perm());
            }
        }
        if self.store.exists(dest, dest_alias) {
            warn!("duplicate destination {} already exists", dest_alias);
            return Err(Error::sys());
        }

        let blob = self.store.get_any(src, src_alias)?;
        self.store.put(dest, dest_alias, &blob)
    }

    /// Remove every blob and grant belonging to a uid. Blobs critical to
    /// device encryption survive when the target is the system principal.
    pub fn clear_uid(&self, caller: u32, target_uid: i64) -> Result<(), Error> {
        let target = access::effective_uid(caller, target_uid as i32);
        self.check_permission_self_or_system(caller, Permission::ClearUid, target)?;
        info!("clear_uid {}", target);

        self.store.remove_grants_for_uid(target);
        for alias in self.store.list(target, "")? {
            if access::is_system(target) {
                match self.store.flags(target, &alias) {
                    Ok(flags) if flags.critical_to_device_encryption => continue,
                    _ => {}
                }
            }
            if let Err(e) = self.store.del(target, &alias) {
                warn!("clear_uid: failed to remove {}: {:?}", alias, e);
            }
            let _ = self.store.del_characteristics(target, &alias);
        }
        Ok(())
    }

    /*
     * Authentication evidence and entropy.
     */

    /// Ingest a hardware auth token delivered by an authenticator.
    pub fn add_auth_token(&self, caller: u32, token: &[u8]) -> Result<(), Error> {
        self.check_permission(caller, Permission::AddAuth)?;
        let token = HardwareAuthToken::from_bytes(token)
            .map_err(|_| Error::Km(ErrorCode::InvalidArgument))?;
        self.auth_tokens.add(token, self.clock.now_ms());
        Ok(())
    }

    /// The device left the user's body; on-body-gated tokens stop
    /// satisfying keys.
    pub fn on_device_off_body(&self) {
        self.auth_tokens.on_device_off_body(self.clock.now_ms());
    }

    /// Mix caller-provided entropy into the primary device's RNG.
    pub fn add_rng_entropy(&self, entropy: &[u8]) -> Result<(), Error> {
        self.primary.add_rng_entropy(entropy).map_err(Error::Km)
    }
}

/// Reject parameters a client must not supply itself.
pub(crate) fn check_client_params(params: &[KeyParam]) -> Result<(), Error> {
    for param in params {
        if operation::DISALLOWED_CLIENT_TAGS.contains(&param.tag()) {
            warn!("client supplied reserved tag {:?}", param.tag());
            return Err(Error::Km(ErrorCode::InvalidArgument));
        }
    }
    Ok(())
}

/// Wall-clock milliseconds since the epoch, for validity-window checks.
pub(crate) fn wall_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
