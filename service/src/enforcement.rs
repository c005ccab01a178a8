//! Authorization-policy checks applied before every device call on behalf of
//! a key: a pure function over the key's merged authorizations and the
//! operation parameters.

use crate::error::Error;
use credstore_wire::types::{
    ErrorCode, HardwareAuthToken, KeyParam, KeyPurpose, Tag,
};
use sha2::{Digest as _, Sha256};

/// Fingerprint identifying a key blob for enforcement purposes.
pub(crate) fn key_id(key_blob: &[u8]) -> u64 {
    let digest = Sha256::digest(key_blob);
    u64::from_le_bytes(digest[..8].try_into().unwrap(/* safe: digest is 32 bytes */))
}

/// Authentication requirements distilled from a key's authorizations.
pub(crate) struct AuthPolicy {
    secure_ids: Vec<u64>,
    auth_type: u32,
    timeout_secs: Option<u32>,
}

impl AuthPolicy {
    /// Build an `AuthPolicy` from key characteristics. Keys without secure
    /// ids (including `NoAuthRequired` keys) need no authentication and
    /// yield `None`.
    pub(crate) fn from_characteristics(key_auths: &[KeyParam]) -> Result<Option<Self>, Error> {
        let mut secure_ids = Vec::new();
        let mut auth_type = None;
        let mut timeout_secs = None;
        let mut no_auth_required = false;

        for param in key_auths {
            match param {
                KeyParam::UserSecureId(sid) => secure_ids.push(*sid),
                KeyParam::UserAuthType(atype) => {
                    if auth_type.is_none() {
                        auth_type = Some(*atype);
                    } else {
                        return Err(Error::Km(ErrorCode::InvalidKeyBlob));
                    }
                }
                KeyParam::AuthTimeout(secs) => {
                    if timeout_secs.is_none() {
                        timeout_secs = Some(*secs);
                    } else {
                        return Err(Error::Km(ErrorCode::InvalidKeyBlob));
                    }
                }
                KeyParam::NoAuthRequired => no_auth_required = true,
                _ => {}
            }
        }

        if secure_ids.is_empty() {
            Ok(None)
        } else if no_auth_required {
            log::error!("key has both NoAuthRequired and UserSecureId");
            Err(Error::Km(ErrorCode::InvalidKeyBlob))
        } else if auth_type.is_none() {
            Err(Error::Km(ErrorCode::KeyUserNotAuthenticated))
        } else {
            Ok(Some(AuthPolicy {
                secure_ids,
                auth_type: auth_type.unwrap_or(0),
                timeout_secs,
            }))
        }
    }

    /// Whether the key demands a fresh token on every update/finish rather
    /// than a one-shot check at begin.
    pub(crate) fn per_operation(&self) -> bool {
        self.timeout_secs.is_none()
    }

    fn satisfied_by(&self, token: &HardwareAuthToken, now_ms: i64) -> bool {
        if !self
            .secure_ids
            .iter()
            .any(|sid| token.user_id == *sid as i64 || token.authenticator_id == *sid as i64)
        {
            log::warn!("auth token matches none of the key's secure ids");
            return false;
        }
        if self.auth_type != 0 && token.authenticator_type & self.auth_type == 0 {
            log::warn!(
                "token authenticator type {:#x} outside key mask {:#x}",
                token.authenticator_type,
                self.auth_type
            );
            return false;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            if now_ms > token.timestamp_ms + 1000 * timeout_secs as i64 {
                log::warn!("auth token expired: {} past {}", now_ms, token.timestamp_ms);
                return false;
            }
        }
        true
    }
}

/// Check that an operation is consistent with the key's declared
/// authorizations. `is_begin` selects the begin-time checks (purpose,
/// validity window, caller nonce); the authentication chain is verified at
/// the phases the key demands it.
pub(crate) fn authorize_operation(
    purpose: KeyPurpose,
    _key_id: u64,
    key_auths: &[KeyParam],
    op_params: &[KeyParam],
    op_handle: u64,
    is_begin: bool,
    now_ms: i64,
    wall_ms: i64,
) -> Result<(), Error> {
    if is_begin {
        check_purpose(purpose, key_auths)?;
        check_caller_nonce(key_auths, op_params)?;
        check_validity_window(purpose, key_auths, wall_ms)?;
    }

    if let Some(policy) = AuthPolicy::from_characteristics(key_auths)? {
        // Timeout-bound keys authenticate once, at begin. Per-operation keys
        // authenticate against the live handle, so only after begin has
        // produced one.
        let needs_token_now =
            if policy.per_operation() { !is_begin } else { is_begin };
        if needs_token_now {
            let token = token_param(op_params)?
                .ok_or(Error::Km(ErrorCode::KeyUserNotAuthenticated))?;
            if !policy.satisfied_by(&token, now_ms) {
                return Err(Error::Km(ErrorCode::KeyUserNotAuthenticated));
            }
            if policy.per_operation() && token.challenge != op_handle as i64 {
                log::warn!(
                    "auth token challenge {} does not match operation {}",
                    token.challenge,
                    op_handle
                );
                return Err(Error::Km(ErrorCode::KeyUserNotAuthenticated));
            }
        }
    }
    Ok(())
}

fn check_purpose(purpose: KeyPurpose, key_auths: &[KeyParam]) -> Result<(), Error> {
    let allowed = key_auths
        .iter()
        .any(|param| matches!(param, KeyParam::Purpose(p) if *p == purpose));
    if allowed {
        Ok(())
    } else {
        Err(Error::Km(ErrorCode::IncompatiblePurpose))
    }
}

fn check_caller_nonce(key_auths: &[KeyParam], op_params: &[KeyParam]) -> Result<(), Error> {
    let has_nonce = op_params.iter().any(|p| p.tag() == Tag::Nonce);
    let nonce_allowed = key_auths.iter().any(|p| p.tag() == Tag::CallerNonce);
    if has_nonce && !nonce_allowed {
        Err(Error::Km(ErrorCode::CallerNonceProhibited))
    } else {
        Ok(())
    }
}

fn check_validity_window(
    purpose: KeyPurpose,
    key_auths: &[KeyParam],
    wall_ms: i64,
) -> Result<(), Error> {
    for param in key_auths {
        match param {
            KeyParam::ActiveDatetime(dt) if wall_ms < dt.ms_since_epoch => {
                return Err(Error::Km(ErrorCode::KeyNotYetValid));
            }
            KeyParam::OriginationExpireDatetime(dt)
                if matches!(
                    purpose,
                    KeyPurpose::Sign | KeyPurpose::Encrypt | KeyPurpose::WrapKey
                ) && wall_ms > dt.ms_since_epoch =>
            {
                return Err(Error::Km(ErrorCode::KeyExpired));
            }
            KeyParam::UsageExpireDatetime(dt)
                if matches!(purpose, KeyPurpose::Verify | KeyPurpose::Decrypt)
                    && wall_ms > dt.ms_since_epoch =>
            {
                return Err(Error::Km(ErrorCode::KeyExpired));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Extract and parse the auth token attached to the operation parameters.
fn token_param(op_params: &[KeyParam]) -> Result<Option<HardwareAuthToken>, Error> {
    for param in op_params {
        if let KeyParam::AuthToken(data) = param {
            return HardwareAuthToken::from_bytes(data)
                .map(Some)
                .map_err(|_| Error::Km(ErrorCode::InvalidArgument));
        }
    }
    Ok(None)
}
