//! Time-aware cache of hardware authentication tokens.
//!
//! Tokens arrive from external authenticators and are matched against key
//! authorization policies when operations start or progress. The table is
//! bounded; completed and superseded entries give way to fresh ones.

use credstore_wire::types::{HardwareAuthToken, KeyParam, KeyPurpose};

use std::sync::Mutex;

/// Maximum number of cached tokens.
const TABLE_SIZE: usize = 32;

/// Outcome of an authorization query.
#[derive(Debug, PartialEq, Eq)]
pub enum FindResult {
    /// A matching, fresh token; attach it to the operation parameters.
    Found(HardwareAuthToken),
    /// The key needs no authentication.
    NotRequired,
    /// No token matches the key's secure ids.
    NotFound,
    /// A token matched but fell outside the key's auth timeout.
    Expired,
    /// A token matched the authenticator mask but named a different secure
    /// id.
    WrongSid,
    /// The key demands per-operation authentication and no challenge-bound
    /// token exists yet.
    OpHandleRequired,
}

struct Entry {
    token: HardwareAuthToken,
    received_ms: i64,
    last_use_ms: i64,
    /// Operation handle the token has been picked for, when per-op bound.
    used_for: Option<u64>,
    /// The using operation finished; the token may be retired.
    completed: bool,
}

struct Inner {
    entries: Vec<Entry>,
    last_off_body_ms: Option<i64>,
}

/// The auth-token table.
pub struct AuthTokenTable {
    inner: Mutex<Inner>,
}

impl AuthTokenTable {
    pub fn new() -> Self {
        AuthTokenTable { inner: Mutex::new(Inner { entries: Vec::new(), last_off_body_ms: None }) }
    }

    /// Insert a freshly delivered token, retiring entries it supersedes and
    /// evicting if the table is full.
    pub fn add(&self, token: HardwareAuthToken, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        // A newer token from the same authenticator for the same user
        // supersedes older ones that no live operation still needs.
        inner.entries.retain(|e| {
            !(e.token.user_id == token.user_id
                && e.token.authenticator_id == token.authenticator_id
                && e.token.authenticator_type == token.authenticator_type
                && e.token.timestamp_ms <= token.timestamp_ms
                && (e.used_for.is_none() || e.completed))
        });
        if inner.entries.len() >= TABLE_SIZE {
            evict_one(&mut inner.entries);
        }
        inner.entries.push(Entry {
            token,
            received_ms: now_ms,
            last_use_ms: now_ms,
            used_for: None,
            completed: false,
        });
    }

    /// Answer whether `key_auths` is satisfied by a cached token for an
    /// operation with the given purpose and handle (0 at begin time).
    pub fn find_authorization(
        &self,
        key_auths: &[KeyParam],
        _purpose: KeyPurpose,
        op_handle: u64,
        now_ms: i64,
    ) -> FindResult {
        let mut secure_ids = Vec::new();
        let mut auth_type_mask = 0u32;
        let mut timeout_secs = None;
        let mut allow_while_on_body = false;
        for param in key_auths {
            match param {
                KeyParam::NoAuthRequired => return FindResult::NotRequired,
                KeyParam::UserSecureId(sid) => secure_ids.push(*sid),
                KeyParam::UserAuthType(mask) => auth_type_mask = *mask,
                KeyParam::AuthTimeout(secs) => timeout_secs = Some(*secs),
                KeyParam::AllowWhileOnBody => allow_while_on_body = true,
                _ => {}
            }
        }
        // Legacy keys may carry no auth parameters at all; treat them as
        // unauthenticated rather than unusable.
        if secure_ids.is_empty() {
            return FindResult::NotRequired;
        }

        let mut inner = self.inner.lock().unwrap();
        match timeout_secs {
            None => {
                Self::find_per_op(&mut inner.entries, &secure_ids, auth_type_mask, op_handle, now_ms)
            }
            Some(timeout) => Self::find_timed(
                &mut inner,
                &secure_ids,
                auth_type_mask,
                timeout,
                allow_while_on_body,
                now_ms,
            ),
        }
    }

    /// Per-operation authentication: the token must carry the operation
    /// handle as its challenge.
    fn find_per_op(
        entries: &mut [Entry],
        secure_ids: &[u64],
        mask: u32,
        op_handle: u64,
        now_ms: i64,
    ) -> FindResult {
        if op_handle == 0 {
            return FindResult::OpHandleRequired;
        }
        let mut wrong_sid = false;
        for entry in entries.iter_mut() {
            if entry.token.challenge != op_handle as i64 {
                continue;
            }
            if !sid_matches(&entry.token, secure_ids) {
                wrong_sid = true;
                continue;
            }
            if mask != 0 && entry.token.authenticator_type & mask == 0 {
                continue;
            }
            entry.used_for = Some(op_handle);
            entry.last_use_ms = now_ms;
            return FindResult::Found(entry.token.clone());
        }
        if wrong_sid {
            FindResult::WrongSid
        } else {
            FindResult::OpHandleRequired
        }
    }

    /// Timeout-based authentication: the most recent matching token wins,
    /// subject to freshness.
    fn find_timed(
        inner: &mut Inner,
        secure_ids: &[u64],
        mask: u32,
        timeout_secs: u32,
        allow_while_on_body: bool,
        now_ms: i64,
    ) -> FindResult {
        let off_body_ms = inner.last_off_body_ms;
        let mut best: Option<usize> = None;
        let mut wrong_sid = false;
        for (idx, entry) in inner.entries.iter().enumerate() {
            if mask != 0 && entry.token.authenticator_type & mask == 0 {
                continue;
            }
            if !sid_matches(&entry.token, secure_ids) {
                wrong_sid = true;
                continue;
            }
            if allow_while_on_body {
                if let Some(off_body) = off_body_ms {
                    if entry.received_ms < off_body {
                        continue;
                    }
                }
            }
            let newer = match best {
                Some(b) => inner.entries[b].token.timestamp_ms < entry.token.timestamp_ms,
                None => true,
            };
            if newer {
                best = Some(idx);
            }
        }
        match best {
            Some(idx) => {
                let entry = &mut inner.entries[idx];
                if now_ms > entry.token.timestamp_ms + 1000 * timeout_secs as i64 {
                    FindResult::Expired
                } else {
                    entry.last_use_ms = now_ms;
                    FindResult::Found(entry.token.clone())
                }
            }
            None if wrong_sid => FindResult::WrongSid,
            None => FindResult::NotFound,
        }
    }

    /// An operation using per-op auth ended; its token may be retired.
    pub fn mark_completed(&self, op_handle: u64) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.iter_mut() {
            if entry.used_for == Some(op_handle) {
                entry.completed = true;
            }
        }
    }

    /// Drop every cached token. Called on password change.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// The device left the user's body: tokens received before this instant
    /// no longer satisfy on-body-gated keys.
    pub fn on_device_off_body(&self, now_ms: i64) {
        self.inner.lock().unwrap().last_off_body_ms = Some(now_ms);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for AuthTokenTable {
    fn default() -> Self {
        Self::new()
    }
}

fn sid_matches(token: &HardwareAuthToken, secure_ids: &[u64]) -> bool {
    secure_ids
        .iter()
        .any(|sid| token.user_id == *sid as i64 || token.authenticator_id == *sid as i64)
}

/// Make room for a new entry: prefer retiring a completed per-op token, then
/// the least recently used entry.
fn evict_one(entries: &mut Vec<Entry>) {
    if let Some(idx) = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.completed)
        .min_by_key(|(_, e)| e.last_use_ms)
        .map(|(idx, _)| idx)
    {
        entries.remove(idx);
        return;
    }
    if let Some(idx) = entries
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.last_use_ms)
        .map(|(idx, _)| idx)
    {
        entries.remove(idx);
    }
}

#[cfg(test)]
mod tests;
