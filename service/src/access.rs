//! Caller identity arithmetic and the permission gate.

use credstore_wire::UID_SELF;

/// Modulus splitting a uid into a user id and a per-user app id.
pub const AID_USER_OFFSET: u32 = 100_000;

/// App id of the system principal within each user.
pub const AID_SYSTEM: u32 = 1000;

/// Platform permission required by `attest_device_ids`, resolved through the
/// injected [`PermissionPolicy`].
pub const PERM_ATTEST_DEVICE_IDS: &str = "attest-device-ids";

/// User id owning a uid.
pub fn get_user_id(uid: u32) -> u32 {
    uid / AID_USER_OFFSET
}

/// Per-user app id of a uid.
pub fn get_app_id(uid: u32) -> u32 {
    uid % AID_USER_OFFSET
}

/// Whether the uid is the system principal of its user.
pub fn is_system(uid: u32) -> bool {
    get_app_id(uid) == AID_SYSTEM
}

/// Resolve an API-level target uid, replacing the [`UID_SELF`] sentinel with
/// the caller.
pub fn effective_uid(caller: u32, target: i32) -> u32 {
    if target == UID_SELF {
        caller
    } else {
        target as u32
    }
}

/// The closed set of service permissions, one per operation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    GetState,
    Get,
    Insert,
    Delete,
    Exist,
    List,
    Reset,
    Password,
    Lock,
    Unlock,
    IsEmpty,
    Sign,
    Verify,
    Grant,
    Duplicate,
    ClearUid,
    AddAuth,
    UserChanged,
    GenUniqueId,
}

/// Answers permission queries against the platform's permission database.
/// The database itself lives outside this service.
pub trait PermissionPolicy: Send + Sync {
    /// Whether `uid` holds the service permission `perm`.
    fn has_permission(&self, uid: u32, perm: Permission) -> bool;

    /// Whether `uid` holds the named platform permission.
    fn has_platform_permission(&self, _uid: u32, _permission: &str) -> bool {
        false
    }
}

/// Built-in policy: system principals hold every permission, ordinary apps
/// hold the per-app set needed to manage and use their own keys.
pub struct DefaultPolicy;

impl PermissionPolicy for DefaultPolicy {
    fn has_permission(&self, uid: u32, perm: Permission) -> bool {
        if is_system(uid) {
            return true;
        }
        matches!(
            perm,
            Permission::Get
                | Permission::Insert
                | Permission::Delete
                | Permission::Exist
                | Permission::List
                | Permission::Sign
                | Permission::Verify
        )
    }
}
