//! Tests

use super::*;
use crate::error::Error;
use crate::masterkey::UserLockState;
use tempfile::TempDir;

const UID_A: u32 = 10001;
const UID_B: u32 = 10044;

fn new_store() -> (TempDir, KeyStore) {
    let dir = TempDir::new().unwrap();
    let store = KeyStore::new(dir.path()).unwrap();
    (dir, store)
}

fn generic(data: &[u8]) -> Blob {
    Blob::new(BlobKind::Generic, BlobFlags::default(), data.to_vec())
}

fn encrypted(data: &[u8]) -> Blob {
    Blob::new(
        BlobKind::Generic,
        BlobFlags { encrypted: true, ..Default::default() },
        data.to_vec(),
    )
}

#[test]
fn test_put_get_round_trip() {
    let (_dir, store) = new_store();
    store.put(UID_A, "blob", &generic(b"payload")).unwrap();
    let blob = store.get(UID_A, "blob", BlobKind::Generic).unwrap();
    assert_eq!(blob.data, b"payload");
    assert_eq!(blob.kind, BlobKind::Generic);

    // Replacement is atomic and total.
    store.put(UID_A, "blob", &generic(b"other")).unwrap();
    assert_eq!(store.get(UID_A, "blob", BlobKind::Generic).unwrap().data, b"other");
}

#[test]
fn test_get_checks_kind() {
    let (_dir, store) = new_store();
    store.put(UID_A, "blob", &generic(b"payload")).unwrap();
    assert_eq!(
        store.get(UID_A, "blob", BlobKind::SecureKey),
        Err(Error::Rc(ResponseCode::KeyNotFound))
    );
    assert!(store.get_any(UID_A, "blob").is_ok());
}

#[test]
fn test_missing_blob_not_found() {
    let (_dir, store) = new_store();
    assert_eq!(
        store.get(UID_A, "nope", BlobKind::Generic),
        Err(Error::Rc(ResponseCode::KeyNotFound))
    );
    assert_eq!(store.del(UID_A, "nope"), Err(Error::Rc(ResponseCode::KeyNotFound)));
    // The characteristics side is idempotent.
    assert_eq!(store.del_characteristics(UID_A, "nope"), Ok(()));
}

#[test]
fn test_encrypted_requires_unlocked_user() {
    let (_dir, store) = new_store();
    // No master key yet.
    assert_eq!(
        store.put(UID_A, "secret", &encrypted(b"data")),
        Err(Error::Rc(ResponseCode::Uninitialized))
    );

    store.users.initialize(0, "password").unwrap();
    store.put(UID_A, "secret", &encrypted(b"data")).unwrap();
    assert_eq!(store.get(UID_A, "secret", BlobKind::Generic).unwrap().data, b"data");

    store.users.lock(0);
    assert_eq!(
        store.get(UID_A, "secret", BlobKind::Generic),
        Err(Error::Rc(ResponseCode::Locked))
    );

    // Wrong password keeps the user locked.
    assert_eq!(
        store.users.unlock(0, "wrong"),
        Err(Error::Rc(ResponseCode::ValueCorrupted))
    );
    assert_eq!(store.users.state(0), UserLockState::Locked);

    store.users.unlock(0, "password").unwrap();
    assert_eq!(store.get(UID_A, "secret", BlobKind::Generic).unwrap().data, b"data");
}

#[test]
fn test_super_encrypted_unreadable_while_locked() {
    let (_dir, store) = new_store();
    store.users.initialize(0, "password").unwrap();
    let blob = Blob::new(
        BlobKind::SecureKey,
        BlobFlags { super_encrypted: true, ..Default::default() },
        b"keyblob".to_vec(),
    );
    store.put(UID_A, "authbound", &blob).unwrap();

    store.users.lock(0);
    assert_eq!(
        store.get(UID_A, "authbound", BlobKind::SecureKey),
        Err(Error::Rc(ResponseCode::Locked))
    );
    // The flags stay readable so callers can tell why.
    assert!(store.flags(UID_A, "authbound").unwrap().super_encrypted);
}

#[test]
fn test_list_filters_by_uid_and_prefix() {
    let (_dir, store) = new_store();
    store.put(UID_A, "signing-key", &generic(b"1")).unwrap();
    store.put(UID_A, "signing-key-2", &generic(b"2")).unwrap();
    store.put(UID_A, "other", &generic(b"3")).unwrap();
    store.put(UID_B, "signing-key", &generic(b"4")).unwrap();

    let listed = store.list(UID_A, "signing-").unwrap();
    assert_eq!(listed, vec!["signing-key".to_string(), "signing-key-2".to_string()]);
    assert_eq!(store.list(UID_A, "").unwrap().len(), 3);
    assert_eq!(store.list(UID_B, "").unwrap().len(), 1);
}

#[test]
fn test_alias_escaping_survives_list() {
    let (_dir, store) = new_store();
    let alias = "com.example/key one+two";
    store.put(UID_A, alias, &generic(b"x")).unwrap();
    assert_eq!(store.list(UID_A, "com.example").unwrap(), vec![alias.to_string()]);
    assert_eq!(store.get(UID_A, alias, BlobKind::Generic).unwrap().data, b"x");
}

#[test]
fn test_characteristics_companion_paths_are_distinct() {
    let (_dir, store) = new_store();
    store.put(UID_A, "key", &Blob::new(BlobKind::SecureKey, Default::default(), b"k".to_vec()))
        .unwrap();
    store
        .put(UID_A, "key", &Blob::new(BlobKind::Characteristics, Default::default(), b"c".to_vec()))
        .unwrap();
    assert_eq!(store.get(UID_A, "key", BlobKind::SecureKey).unwrap().data, b"k");
    assert_eq!(store.get(UID_A, "key", BlobKind::Characteristics).unwrap().data, b"c");
    // Companions are hidden from listings.
    assert_eq!(store.list(UID_A, "").unwrap(), vec!["key".to_string()]);
}

#[test]
fn test_grant_round_trip() {
    let (_dir, store) = new_store();
    store.put(UID_A, "shared", &generic(b"payload")).unwrap();

    let grant_alias = store.add_grant(UID_A, "shared", UID_B);
    assert!(grant_alias.starts_with("ks_grant_"));
    // Granting again returns the same alias.
    assert_eq!(store.add_grant(UID_A, "shared", UID_B), grant_alias);

    assert!(store.is_granted_to(UID_B, UID_A));
    assert!(!store.is_granted_to(UID_B, UID_B + 1));
    assert_eq!(store.canonical_owner(UID_B, &grant_alias), (UID_A, "shared".to_string()));

    let via_grant = store.get_key_for_name(UID_B, &grant_alias, BlobKind::Generic).unwrap();
    assert_eq!(via_grant.data, b"payload");

    assert!(store.remove_grant(UID_A, "shared", UID_B));
    assert!(!store.remove_grant(UID_A, "shared", UID_B));
    assert_eq!(
        store.get_key_for_name(UID_B, &grant_alias, BlobKind::Generic),
        Err(Error::Rc(ResponseCode::KeyNotFound))
    );
}

#[test]
fn test_remove_grants_for_uid_covers_both_sides() {
    let (_dir, store) = new_store();
    store.put(UID_A, "a", &generic(b"1")).unwrap();
    store.put(UID_B, "b", &generic(b"2")).unwrap();
    store.add_grant(UID_A, "a", UID_B);
    store.add_grant(UID_B, "b", UID_A);

    store.remove_grants_for_uid(UID_B);
    assert!(!store.is_granted_to(UID_B, UID_A));
    assert!(!store.is_granted_to(UID_A, UID_B));
}

#[test]
fn test_reset_user_keep_unencrypted() {
    let (_dir, store) = new_store();
    store.users.initialize(0, "password").unwrap();
    store.put(UID_A, "plain", &generic(b"plain")).unwrap();
    store.put(UID_A, "wrapped", &encrypted(b"wrapped")).unwrap();

    store.reset_user(0, true).unwrap();
    assert_eq!(store.users.state(0), UserLockState::Uninitialized);
    assert_eq!(store.get(UID_A, "plain", BlobKind::Generic).unwrap().data, b"plain");
    assert_eq!(
        store.get(UID_A, "wrapped", BlobKind::Generic),
        Err(Error::Rc(ResponseCode::KeyNotFound))
    );
}

#[test]
fn test_reset_user_full_wipe() {
    let (_dir, store) = new_store();
    store.users.initialize(0, "password").unwrap();
    store.put(UID_A, "plain", &generic(b"plain")).unwrap();
    store.put(UID_A, "wrapped", &encrypted(b"wrapped")).unwrap();

    store.reset_user(0, false).unwrap();
    assert_eq!(store.users.state(0), UserLockState::Uninitialized);
    assert!(store.list(UID_A, "").unwrap().is_empty());
    assert!(store.is_empty(0));
}

#[test]
fn test_is_empty_ignores_master_key() {
    let (_dir, store) = new_store();
    assert!(store.is_empty(0));
    store.users.initialize(0, "password").unwrap();
    assert!(store.is_empty(0));
    store.put(UID_A, "blob", &generic(b"x")).unwrap();
    assert!(!store.is_empty(0));
}

#[test]
fn test_master_key_copy_shares_password() {
    let (_dir, store) = new_store();
    store.users.initialize(0, "parent-pw").unwrap();
    store.users.copy(0, 10).unwrap();

    // The child was unlocked along with its (unlocked) parent.
    assert_eq!(store.users.state(10), UserLockState::Unlocked);

    // After a restart-like lock, the parent's password opens the child.
    store.users.lock(10);
    assert_eq!(store.users.state(10), UserLockState::Locked);
    store.users.unlock(10, "parent-pw").unwrap();
    assert_eq!(store.users.state(10), UserLockState::Unlocked);
}

#[test]
fn test_rewrap_changes_password() {
    let (_dir, store) = new_store();
    store.users.initialize(0, "old").unwrap();
    store.put(UID_A, "secret", &encrypted(b"data")).unwrap();

    store.users.rewrap(0, "new").unwrap();
    store.users.lock(0);
    assert_eq!(store.users.unlock(0, "old"), Err(Error::Rc(ResponseCode::ValueCorrupted)));
    store.users.unlock(0, "new").unwrap();
    // Blobs wrapped before the password change still open.
    assert_eq!(store.get(UID_A, "secret", BlobKind::Generic).unwrap().data, b"data");
}
