//! Tests

use super::*;
use credstore_wire::types::{HardwareAuthenticatorType, KeySizeInBits};

const SID: u64 = 1001;
const PASSWORD: u32 = HardwareAuthenticatorType::Password as u32;
const FINGERPRINT: u32 = HardwareAuthenticatorType::Fingerprint as u32;

fn token(challenge: i64, user_id: i64, auth_type: u32, timestamp_ms: i64) -> HardwareAuthToken {
    HardwareAuthToken {
        challenge,
        user_id,
        authenticator_id: 0,
        authenticator_type: auth_type,
        timestamp_ms,
        mac: vec![0u8; 32],
    }
}

fn timed_key(sid: u64, mask: u32, timeout_secs: u32) -> Vec<KeyParam> {
    vec![
        KeyParam::UserSecureId(sid),
        KeyParam::UserAuthType(mask),
        KeyParam::AuthTimeout(timeout_secs),
    ]
}

fn per_op_key(sid: u64, mask: u32) -> Vec<KeyParam> {
    vec![KeyParam::UserSecureId(sid), KeyParam::UserAuthType(mask)]
}

#[test]
fn test_no_auth_required() {
    let table = AuthTokenTable::new();
    let key = vec![KeyParam::NoAuthRequired, KeyParam::KeySize(KeySizeInBits(256))];
    assert_eq!(
        table.find_authorization(&key, KeyPurpose::Sign, 0, 0),
        FindResult::NotRequired
    );
    // Keys listing no secure ids at all are also unauthenticated.
    assert_eq!(
        table.find_authorization(&[], KeyPurpose::Sign, 0, 0),
        FindResult::NotRequired
    );
}

#[test]
fn test_timed_key_finds_fresh_token() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);
    match table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 2_000) {
        FindResult::Found(t) => assert_eq!(t.timestamp_ms, 1_000),
        other => panic!("expected Found, got {:?}", other),
    }
}

#[test]
fn test_timed_key_expiry() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);
    // 60s timeout, now is 62s past the token timestamp.
    assert_eq!(
        table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 63_000),
        FindResult::Expired
    );
}

#[test]
fn test_most_recent_matching_token_wins() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);
    table.add(token(0, SID as i64, FINGERPRINT, 5_000), 5_000);
    match table.find_authorization(
        &timed_key(SID, PASSWORD | FINGERPRINT, 60),
        KeyPurpose::Sign,
        0,
        6_000,
    ) {
        FindResult::Found(t) => assert_eq!(t.timestamp_ms, 5_000),
        other => panic!("expected Found, got {:?}", other),
    }
}

#[test]
fn test_authenticator_mask_mismatch() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, FINGERPRINT, 1_000), 1_000);
    assert_eq!(
        table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 2_000),
        FindResult::NotFound
    );
}

#[test]
fn test_wrong_sid() {
    let table = AuthTokenTable::new();
    table.add(token(0, 999, PASSWORD, 1_000), 1_000);
    assert_eq!(
        table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 2_000),
        FindResult::WrongSid
    );
}

#[test]
fn test_per_op_requires_challenge_bound_token() {
    let table = AuthTokenTable::new();
    let key = per_op_key(SID, PASSWORD);

    // At begin time there is no handle yet.
    assert_eq!(
        table.find_authorization(&key, KeyPurpose::Sign, 0, 1_000),
        FindResult::OpHandleRequired
    );

    // A handle exists but no token names it.
    assert_eq!(
        table.find_authorization(&key, KeyPurpose::Sign, 77, 1_000),
        FindResult::OpHandleRequired
    );

    table.add(token(77, SID as i64, PASSWORD, 1_000), 1_000);
    match table.find_authorization(&key, KeyPurpose::Sign, 77, 2_000) {
        FindResult::Found(t) => assert_eq!(t.challenge, 77),
        other => panic!("expected Found, got {:?}", other),
    }
}

#[test]
fn test_per_op_wrong_sid() {
    let table = AuthTokenTable::new();
    table.add(token(77, 999, PASSWORD, 1_000), 1_000);
    assert_eq!(
        table.find_authorization(&per_op_key(SID, PASSWORD), KeyPurpose::Sign, 77, 2_000),
        FindResult::WrongSid
    );
}

#[test]
fn test_mark_completed_allows_eviction() {
    let table = AuthTokenTable::new();
    table.add(token(77, SID as i64, PASSWORD, 1_000), 1_000);
    let key = per_op_key(SID, PASSWORD);
    assert!(matches!(
        table.find_authorization(&key, KeyPurpose::Sign, 77, 2_000),
        FindResult::Found(_)
    ));
    table.mark_completed(77);

    // Fill the table; the completed entry goes first and the table stays
    // bounded.
    for i in 0..40i64 {
        table.add(token(0, 5000 + i, PASSWORD, 10_000 + i), 10_000 + i);
    }
    assert!(table.len() <= 32);
    assert_eq!(
        table.find_authorization(&key, KeyPurpose::Sign, 77, 11_000),
        FindResult::OpHandleRequired
    );
}

#[test]
fn test_newer_token_supersedes_older() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);
    table.add(token(0, SID as i64, PASSWORD, 9_000), 9_000);
    assert_eq!(table.len(), 1);
    match table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 9_500) {
        FindResult::Found(t) => assert_eq!(t.timestamp_ms, 9_000),
        other => panic!("expected Found, got {:?}", other),
    }
}

#[test]
fn test_clear() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);
    table.clear();
    assert_eq!(
        table.find_authorization(&timed_key(SID, PASSWORD, 60), KeyPurpose::Sign, 0, 2_000),
        FindResult::NotFound
    );
}

#[test]
fn test_off_body_invalidates_on_body_tokens() {
    let table = AuthTokenTable::new();
    table.add(token(0, SID as i64, PASSWORD, 1_000), 1_000);

    let mut key = timed_key(SID, PASSWORD, 600);
    key.push(KeyParam::AllowWhileOnBody);

    assert!(matches!(
        table.find_authorization(&key, KeyPurpose::Sign, 0, 2_000),
        FindResult::Found(_)
    ));

    table.on_device_off_body(3_000);
    assert_eq!(
        table.find_authorization(&key, KeyPurpose::Sign, 0, 4_000),
        FindResult::NotFound
    );

    // A token received after the off-body event satisfies again.
    table.add(token(0, SID as i64, PASSWORD, 5_000), 5_000);
    assert!(matches!(
        table.find_authorization(&key, KeyPurpose::Sign, 0, 6_000),
        FindResult::Found(_)
    ));

    // Keys without the on-body gate are unaffected by the event.
    assert!(matches!(
        table.find_authorization(&timed_key(SID, PASSWORD, 600), KeyPurpose::Sign, 0, 4_000),
        FindResult::Found(_)
    ));
}
