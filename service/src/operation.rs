//! In-flight cryptographic operations: the bounded operation map, pruning,
//! and the begin/update/finish/abort entry points.
//!
//! Each live operation pairs an opaque client-facing token with the secure
//! device's operation handle. The map never exceeds [`MAX_OPERATIONS`]
//! entries; when a new `begin` needs a slot, the oldest operation started as
//! pruneable is aborted to make room. Within one operation, device calls are
//! serialized by a per-operation lock; across operations the device's own
//! contract governs concurrency.

use crate::authtoken::FindResult;
use crate::device::{ClientRef, DeviceKind, FinishOutput, UpdateOutput};
use crate::enforcement;
use crate::error::Error;
use crate::store::BlobKind;
use crate::{wall_ms, Service};
use credstore_wire::types::{
    ErrorCode, HardwareAuthToken, KeyCharacteristics, KeyParam, KeyPurpose, Tag,
};
use credstore_wire::ResponseCode;
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Capacity of the operation map.
pub(crate) const MAX_OPERATIONS: usize = 15;

/// Opaque token identifying a live operation to its client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpToken(pub u64);

/// State of one in-flight operation.
pub(crate) struct Operation {
    pub token: OpToken,
    /// Secure-device operation handle, also the auth challenge.
    pub handle: u64,
    /// Which device instance the operation runs on.
    pub kind: DeviceKind,
    pub purpose: KeyPurpose,
    /// Fingerprint of the key blob, for enforcement.
    pub key_id: u64,
    /// Merged key characteristics captured at begin.
    pub characteristics: KeyCharacteristics,
    /// Identity of the owning client; its death aborts the operation.
    pub client: u64,
    pub pruneable: bool,
    /// Insertion order; pruning removes the lowest pruneable sequence.
    pub seq: u64,
    /// Auth token bound to the operation, once one has been selected.
    pub auth_token: Mutex<Option<HardwareAuthToken>>,
    /// Serializes device calls for this handle.
    pub slot: Mutex<()>,
}

/// The bounded map of live operations.
pub(crate) struct OperationMap {
    ops: Mutex<HashMap<OpToken, Arc<Operation>>>,
    seq: AtomicU64,
}

impl OperationMap {
    pub fn new() -> Self {
        OperationMap { ops: Mutex::new(HashMap::new()), seq: AtomicU64::new(0) }
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// Insert an operation under a fresh random token.
    pub fn insert(&self, mut op: Operation) -> (OpToken, Arc<Operation>) {
        let mut ops = self.ops.lock().unwrap();
        let mut token = OpToken(OsRng.next_u64());
        while ops.contains_key(&token) {
            token = OpToken(OsRng.next_u64());
        }
        op.token = token;
        op.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let op = Arc::new(op);
        ops.insert(token, op.clone());
        (token, op)
    }

    pub fn get(&self, token: OpToken) -> Option<Arc<Operation>> {
        self.ops.lock().unwrap().get(&token).cloned()
    }

    pub fn remove(&self, token: OpToken) -> Option<Arc<Operation>> {
        self.ops.lock().unwrap().remove(&token)
    }

    /// Token of the oldest operation started as pruneable.
    pub fn oldest_pruneable(&self) -> Option<OpToken> {
        self.ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| op.pruneable)
            .min_by_key(|op| op.seq)
            .map(|op| op.token)
    }

    pub fn has_pruneable(&self) -> bool {
        self.ops.lock().unwrap().values().any(|op| op.pruneable)
    }

    pub fn tokens_for_client(&self, client: u64) -> Vec<OpToken> {
        self.ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| op.client == client)
            .map(|op| op.token)
            .collect()
    }
}

/// What `begin` hands back to the client.
pub struct BeginResult {
    /// Token for subsequent update/finish/abort calls.
    pub token: OpToken,
    /// Device operation handle; per-operation auth tokens must carry it as
    /// their challenge.
    pub handle: u64,
    /// Parameters returned by the device's begin.
    pub out_params: Vec<KeyParam>,
    /// The key demands per-operation authentication: the client must deliver
    /// a token bound to this operation before the first update.
    pub op_auth_needed: bool,
}

/// Merge the characteristics persisted at key creation into the live set
/// from the device: union with the software-enforced half, minus anything
/// the device now enforces itself. Off-device policy survives restarts this
/// way.
fn merge_characteristics(
    live: &KeyCharacteristics,
    persisted: &[KeyParam],
) -> KeyCharacteristics {
    let mut software: Vec<KeyParam> = persisted.to_vec();
    for param in &live.software_enforced {
        if !software.contains(param) {
            software.push(param.clone());
        }
    }
    software.retain(|param| !live.tee_enforced.contains(param));
    KeyCharacteristics { software_enforced: software, tee_enforced: live.tee_enforced.clone() }
}

impl Service {
    /// Start a cryptographic operation on the named key.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &self,
        caller: u32,
        client: &dyn ClientRef,
        alias: &str,
        purpose: KeyPurpose,
        pruneable: bool,
        params: &[KeyParam],
        entropy: &[u8],
        uid: i32,
    ) -> Result<BeginResult, Error> {
        let target = crate::access::effective_uid(caller, uid);
        if !self.store.is_granted_to(caller, target) {
            warn!("uid {} not permitted to act for uid {} in begin", caller, target);
            return Err(Error::perm());
        }
        if !pruneable && !crate::access::is_system(caller) {
            warn!("non-system uid {} tried to start a pinned operation", caller);
            return Err(Error::perm());
        }
        crate::check_client_params(params)?;

        let mut key_blob = match self.store.get_key_for_name(target, alias, BlobKind::SecureKey) {
            Ok(blob) => blob,
            Err(Error::Rc(ResponseCode::Locked)) => {
                // An auth-bound key is not a state error: the user has to
                // authenticate.
                let flags = self.store.flags_for_name(target, alias).unwrap_or_default();
                return Err(if flags.super_encrypted {
                    Error::Km(ErrorCode::KeyUserNotAuthenticated)
                } else {
                    Error::Rc(ResponseCode::Locked)
                });
            }
            Err(e) => return Err(e),
        };

        let device = self.device_of_flags(key_blob.flags);
        let kind = device_kind(key_blob.flags);

        // Fetch the live characteristics, upgrading the blob if the device
        // reports a stale format.
        let (client_id, app_data) = operation_app_params(params);
        let live = match device.get_characteristics(&key_blob.data, &client_id, &app_data) {
            Ok(chars) => chars,
            Err(ErrorCode::KeyRequiresUpgrade) => {
                key_blob = self.upgrade_key_blob(target, alias, params)?;
                device
                    .get_characteristics(&key_blob.data, &client_id, &app_data)
                    .map_err(Error::Km)?
            }
            Err(e) => return Err(Error::Km(e)),
        };

        // Merge in the characteristics cached when the key was created.
        let persisted = self.persisted_characteristics(target, alias);
        let characteristics = merge_characteristics(&live, &persisted);
        let key_auths = characteristics.all();

        // Ask the token table for an authorization. Per-operation auth is
        // not yet satisfiable (there is no handle), so it is remembered and
        // surfaced in the result instead of failing begin.
        let mut op_auth_needed = false;
        let auth_token = match self.auth_tokens.find_authorization(
            &key_auths,
            purpose,
            0,
            self.clock.now_ms(),
        ) {
            FindResult::Found(token) => Some(token),
            FindResult::NotRequired => None,
            FindResult::OpHandleRequired => {
                op_auth_needed = true;
                None
            }
            result => {
                info!("begin: no usable auth token: {:?}", result);
                return Err(Error::Km(ErrorCode::KeyUserNotAuthenticated));
            }
        };

        let mut op_params = params.to_vec();
        if let Some(token) = &auth_token {
            op_params.push(KeyParam::AuthToken(token.to_bytes()));
        }

        if !entropy.is_empty() {
            self.primary.add_rng_entropy(entropy).map_err(Error::Km)?;
        }

        let key_id = enforcement::key_id(&key_blob.data);
        enforcement::authorize_operation(
            purpose,
            key_id,
            &key_auths,
            &op_params,
            0,
            true,
            self.clock.now_ms(),
            wall_ms(),
        )?;

        // Free a slot if the map is full, then drive the device, pruning and
        // retrying while it reports operation exhaustion. The map never
        // exceeds its capacity: with nothing pruneable, begin fails.
        while self.operations.len() >= MAX_OPERATIONS {
            info!("operation map at capacity ({})", MAX_OPERATIONS);
            if !self.prune_one() {
                return Err(Error::Km(ErrorCode::TooManyOperations));
            }
        }
        let mut outcome = device.begin(purpose, &key_blob.data, &op_params);
        while matches!(outcome, Err(ErrorCode::TooManyOperations)) {
            warn!("device out of operation slots");
            if !self.operations.has_pruneable() || !self.prune_one() {
                break;
            }
            outcome = device.begin(purpose, &key_blob.data, &op_params);
        }
        let begun = outcome.map_err(Error::Km)?;

        let (token, _op) = self.operations.insert(Operation {
            token: OpToken(0),
            handle: begun.handle,
            kind,
            purpose,
            key_id,
            characteristics,
            client: client.identity(),
            pruneable,
            seq: 0,
            auth_token: Mutex::new(auth_token),
            slot: Mutex::new(()),
        });

        Ok(BeginResult {
            token,
            handle: begun.handle,
            out_params: begun.out_params,
            op_auth_needed,
        })
    }

    /// Feed data to a live operation. The operation survives errors; only
    /// finish/abort/pruning/client death end it.
    pub fn update(
        &self,
        token: OpToken,
        params: &[KeyParam],
        input: &[u8],
    ) -> Result<UpdateOutput, Error> {
        crate::check_client_params(params)?;
        let op = self
            .operations
            .get(token)
            .ok_or(Error::Km(ErrorCode::InvalidOperationHandle))?;
        let mut op_params = params.to_vec();
        self.attach_op_auth(&op, &mut op_params)?;
        enforcement::authorize_operation(
            op.purpose,
            op.key_id,
            &op.characteristics.all(),
            &op_params,
            op.handle,
            false,
            self.clock.now_ms(),
            wall_ms(),
        )?;
        let _slot = op.slot.lock().unwrap();
        self.device_of(op.kind).update(op.handle, &op_params, input).map_err(Error::Km)
    }

    /// Complete a live operation. The operation is removed and the token
    /// table notified whatever the device answers.
    pub fn finish(
        &self,
        token: OpToken,
        params: &[KeyParam],
        signature: &[u8],
        entropy: &[u8],
    ) -> Result<FinishOutput, Error> {
        crate::check_client_params(params)?;
        let op = self
            .operations
            .get(token)
            .ok_or(Error::Km(ErrorCode::InvalidOperationHandle))?;
        let mut op_params = params.to_vec();
        self.attach_op_auth(&op, &mut op_params)?;
        if !entropy.is_empty() {
            self.primary.add_rng_entropy(entropy).map_err(Error::Km)?;
        }
        enforcement::authorize_operation(
            op.purpose,
            op.key_id,
            &op.characteristics.all(),
            &op_params,
            op.handle,
            false,
            self.clock.now_ms(),
            wall_ms(),
        )?;

        let outcome = {
            let _slot = op.slot.lock().unwrap();
            self.device_of(op.kind).finish(op.handle, &op_params, &[], signature)
        };
        // Remove the operation regardless of the device verdict.
        self.operations.remove(token);
        self.auth_tokens.mark_completed(op.handle);
        outcome.map_err(Error::Km)
    }

    /// Abort a live operation. A token that no longer names one reports
    /// `InvalidOperationHandle`; the call is otherwise harmless.
    pub fn abort(&self, token: OpToken) -> Result<(), Error> {
        let op = self
            .operations
            .remove(token)
            .ok_or(Error::Km(ErrorCode::InvalidOperationHandle))?;
        let outcome = {
            let _slot = op.slot.lock().unwrap();
            self.device_of(op.kind).abort(op.handle)
        };
        self.auth_tokens.mark_completed(op.handle);
        outcome.map_err(Error::Km)
    }

    /// Whether the operation could attach a satisfying auth token right now.
    pub fn is_operation_authorized(&self, token: OpToken) -> bool {
        match self.operations.get(token) {
            Some(op) => self.attach_op_auth(&op, &mut Vec::new()).is_ok(),
            None => false,
        }
    }

    /// A client went away: abort everything it owned, as if it had called
    /// abort on each operation.
    pub fn client_died(&self, client: u64) {
        for token in self.operations.tokens_for_client(client) {
            info!("aborting operation {:?} of dead client {}", token, client);
            if let Err(e) = self.abort(token) {
                warn!("abort for dead client failed: {:?}", e);
            }
        }
    }

    /// Abort the oldest pruneable operation. Returns whether a slot was
    /// freed.
    pub(crate) fn prune_one(&self) -> bool {
        let Some(token) = self.operations.oldest_pruneable() else {
            return false;
        };
        info!("pruning operation {:?}", token);
        let before = self.operations.len();
        if let Err(e) = self.abort(token) {
            warn!("pruning abort reported {:?}", e);
        }
        self.operations.len() < before
    }

    /// Attach the operation's auth token to `params`, selecting one from the
    /// table on first need. Keys without auth requirements attach nothing.
    fn attach_op_auth(
        &self,
        op: &Operation,
        params: &mut Vec<KeyParam>,
    ) -> Result<(), Error> {
        let cached = op.auth_token.lock().unwrap().clone();
        let token = match cached {
            Some(token) => Some(token),
            None => match self.auth_tokens.find_authorization(
                &op.characteristics.all(),
                op.purpose,
                op.handle,
                self.clock.now_ms(),
            ) {
                FindResult::Found(token) => {
                    *op.auth_token.lock().unwrap() = Some(token.clone());
                    Some(token)
                }
                FindResult::NotRequired => None,
                result => {
                    info!("operation auth lookup failed: {:?}", result);
                    return Err(Error::Km(ErrorCode::KeyUserNotAuthenticated));
                }
            },
        };
        if let Some(token) = token {
            params.push(KeyParam::AuthToken(token.to_bytes()));
        }
        Ok(())
    }
}

/// Which device a blob with these flags is routed to.
pub(crate) fn device_kind(flags: crate::store::BlobFlags) -> DeviceKind {
    if flags.fallback {
        DeviceKind::Fallback
    } else {
        DeviceKind::Primary
    }
}

/// Client id / app data attached to the operation parameters, needed when
/// fetching characteristics of keys bound to them.
pub(crate) fn operation_app_params(params: &[KeyParam]) -> (Vec<u8>, Vec<u8>) {
    let mut client_id = Vec::new();
    let mut app_data = Vec::new();
    for param in params {
        match param {
            KeyParam::ApplicationId(data) => client_id = data.clone(),
            KeyParam::ApplicationData(data) => app_data = data.clone(),
            _ => {}
        }
    }
    (client_id, app_data)
}

/// Tags a client must not supply itself; the service owns them.
pub(crate) const DISALLOWED_CLIENT_TAGS: &[Tag] =
    &[Tag::AttestationApplicationId, Tag::AuthToken, Tag::ResetSinceIdRotation];
