//! Ratchet protocol scenarios across the public session API
//!
//! Long-running conversations, reordering, skip bounds, epoch scheduling,
//! and rejection of stale or altered ciphertext.

use std::time::Instant;

use ferry_crypto::{CryptoError, RatchetConfig, SessionState};
use ferry_integration_tests::connected_pair;

fn single_epoch(max_skip: u32) -> RatchetConfig {
    RatchetConfig {
        max_skip,
        epoch_message_threshold: 100_000,
        ..RatchetConfig::default()
    }
}

// ============================================================================
// Long conversations
// ============================================================================

#[test]
fn test_ten_thousand_messages_in_order() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    for i in 0..10_000u32 {
        let msg = alice.encrypt(&i.to_be_bytes(), b"bulk").unwrap();
        assert_eq!(bob.decrypt(&msg, b"bulk").unwrap(), i.to_be_bytes());
    }
    assert_eq!(alice.send_epoch(), Some(999));
    assert_eq!(bob.recv_epoch(), Some(999));
    assert_eq!(bob.state(), SessionState::Established);
}

#[test]
fn test_conversation_with_direction_changes() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    for round in 0..50u32 {
        for i in 0..(round % 4 + 1) {
            let m = alice.encrypt(&[round as u8, i as u8], b"").unwrap();
            assert_eq!(bob.decrypt(&m, b"").unwrap(), vec![round as u8, i as u8]);
        }
        let reply = bob.encrypt(&round.to_le_bytes(), b"").unwrap();
        assert_eq!(alice.decrypt(&reply, b"").unwrap(), round.to_le_bytes());
    }
    assert_eq!(alice.session_id(), bob.session_id());
}

// ============================================================================
// Reordering and skip bounds
// ============================================================================

#[test]
fn test_reverse_delivery_within_skip_bound() {
    let (mut alice, mut bob) = connected_pair(single_epoch(64));
    let msgs: Vec<_> = (0..50u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();
    for (i, m) in msgs.iter().enumerate().rev() {
        assert_eq!(bob.decrypt(m, b"").unwrap(), vec![i as u8]);
    }
}

#[test]
fn test_interleaved_delivery_within_skip_bound() {
    let (mut alice, mut bob) = connected_pair(single_epoch(32));
    let msgs: Vec<_> = (0..30u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();
    let order = (0..30)
        .filter(|i| i % 2 == 1)
        .chain((0..30).filter(|i| i % 2 == 0));
    for i in order {
        assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
    }
}

#[test]
fn test_gap_beyond_skip_bound_terminates() {
    let (mut alice, mut bob) = connected_pair(single_epoch(16));
    let msgs: Vec<_> = (0..40u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();

    assert_eq!(bob.decrypt(&msgs[0], b"").unwrap(), vec![0]);
    let err = bob.decrypt(&msgs[39], b"").unwrap_err();
    assert!(matches!(err, CryptoError::SkipLimitExceeded { .. }));
    assert_eq!(bob.state(), SessionState::Terminated);

    for m in &msgs[1..5] {
        assert_eq!(bob.decrypt(m, b""), Err(CryptoError::SessionTerminated));
    }
}

// ============================================================================
// Epoch scheduling
// ============================================================================

#[test]
fn test_epoch_advances_after_message_threshold() {
    let config = RatchetConfig {
        epoch_message_threshold: 5,
        ..RatchetConfig::default()
    };
    let (mut alice, mut bob) = connected_pair(config);

    let epochs: Vec<u64> = (0..12u8)
        .map(|i| {
            let m = alice.encrypt(&[i], b"").unwrap();
            assert_eq!(bob.decrypt(&m, b"").unwrap(), vec![i]);
            m.header.epoch
        })
        .collect();
    assert_eq!(epochs, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 2]);
    assert_eq!(bob.recv_epoch(), Some(2));
}

#[test]
fn test_epoch_advances_after_interval() {
    let (mut alice, mut bob) = connected_pair(single_epoch(100));
    let start = Instant::now();
    let interval = single_epoch(100).epoch_interval();

    let first = alice.encrypt_at(b"a", b"", start).unwrap();
    let quiet = alice.encrypt_at(b"b", b"", start + interval / 2).unwrap();
    let late = alice.encrypt_at(b"c", b"", start + interval).unwrap();
    assert_eq!(first.header.epoch, 0);
    assert_eq!(quiet.header.epoch, 0);
    assert_eq!(late.header.epoch, 1);
    assert!(late.header.kem_ciphertext.is_some());

    for (m, expected) in [(&first, b"a"), (&quiet, b"b"), (&late, b"c")] {
        assert_eq!(bob.decrypt(m, b"").unwrap(), expected.to_vec());
    }
}

#[test]
fn test_rekey_carrier_opens_new_epoch() {
    let (mut alice, mut bob) = connected_pair(single_epoch(100));
    let hello = alice.encrypt(b"hello", b"").unwrap();
    bob.decrypt(&hello, b"").unwrap();

    let carrier = alice.rekey(b"rekey").unwrap();
    assert_eq!(bob.decrypt(&carrier, b"rekey").unwrap(), Vec::<u8>::new());
    assert_eq!(bob.recv_epoch(), Some(1));
    assert_eq!(alice.send_epoch(), Some(1));
}

#[test]
fn test_delayed_message_from_previous_epoch_still_opens() {
    let config = RatchetConfig {
        epoch_message_threshold: 4,
        ..RatchetConfig::default()
    };
    let (mut alice, mut bob) = connected_pair(config);
    let msgs: Vec<_> = (0..8u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();

    for i in [0usize, 1, 2, 4, 5, 6, 7] {
        assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
    }
    assert_eq!(bob.recv_epoch(), Some(1));
    assert_eq!(bob.decrypt(&msgs[3], b"").unwrap(), vec![3]);
}

// ============================================================================
// Rejection without teardown
// ============================================================================

#[test]
fn test_replay_from_retained_epoch_is_rejected_non_fatally() {
    let config = RatchetConfig {
        epoch_message_threshold: 3,
        ..RatchetConfig::default()
    };
    let (mut alice, mut bob) = connected_pair(config);
    let old = alice.encrypt(b"epoch zero", b"").unwrap();
    bob.decrypt(&old, b"").unwrap();
    for i in 0..4u8 {
        let m = alice.encrypt(&[i], b"").unwrap();
        bob.decrypt(&m, b"").unwrap();
    }
    assert_eq!(bob.recv_epoch(), Some(1));

    assert!(matches!(
        bob.decrypt(&old, b""),
        Err(CryptoError::ReplayDetected { .. })
    ));
    assert_ne!(bob.state(), SessionState::Terminated);

    let next = alice.encrypt(b"still fine", b"").unwrap();
    assert_eq!(bob.decrypt(&next, b"").unwrap(), b"still fine");
}

#[test]
fn test_gap_spanning_several_epochs_decrypts() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    let msgs: Vec<_> = (0..60u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();

    // Message 0 and message 17 are held back while five epochs go by.
    for i in (1..60).filter(|&i| i != 17) {
        assert_eq!(bob.decrypt(&msgs[i], b"").unwrap(), vec![i as u8]);
    }
    assert_eq!(bob.recv_epoch(), Some(5));

    assert_eq!(bob.decrypt(&msgs[17], b"").unwrap(), vec![17]);
    assert_eq!(bob.decrypt(&msgs[0], b"").unwrap(), vec![0]);
    assert_eq!(bob.state(), SessionState::Established);

    let next = alice.encrypt(b"after", b"").unwrap();
    assert_eq!(bob.decrypt(&next, b"").unwrap(), b"after");
}

#[test]
fn test_replay_from_wiped_epoch_terminates() {
    let config = RatchetConfig {
        epoch_message_threshold: 3,
        retained_epoch_keys: 1,
        ..RatchetConfig::default()
    };
    let (mut alice, mut bob) = connected_pair(config);
    let msgs: Vec<_> = (0..9u8)
        .map(|i| alice.encrypt(&[i], b"").unwrap())
        .collect();
    for m in &msgs {
        bob.decrypt(m, b"").unwrap();
    }
    assert_eq!(bob.recv_epoch(), Some(2));

    assert!(matches!(
        bob.decrypt(&msgs[0], b""),
        Err(CryptoError::EpochExpired { epoch: 0, .. })
    ));
    assert_eq!(bob.state(), SessionState::Terminated);
}

#[test]
fn test_replay_in_current_epoch_is_reported() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    let m = alice.encrypt(b"once", b"").unwrap();
    bob.decrypt(&m, b"").unwrap();
    assert!(matches!(
        bob.decrypt(&m, b""),
        Err(CryptoError::ReplayDetected { .. })
    ));
    assert_eq!(bob.state(), SessionState::Established);
}

#[test]
fn test_altered_ciphertext_does_not_corrupt_state() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    let mut forged = alice.encrypt(b"payload", b"aad").unwrap();
    forged.ciphertext[0] ^= 0x01;
    assert_eq!(
        bob.decrypt(&forged, b"aad"),
        Err(CryptoError::DecryptionFailed)
    );
    assert_ne!(bob.state(), SessionState::Terminated);

    let genuine = alice.encrypt(b"payload 2", b"aad").unwrap();
    assert_eq!(bob.decrypt(&genuine, b"aad").unwrap(), b"payload 2");
}

#[test]
fn test_mismatched_associated_data_is_rejected() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    let m = alice.encrypt(b"chunk", b"transfer-a").unwrap();
    assert_eq!(
        bob.decrypt(&m, b"transfer-b"),
        Err(CryptoError::DecryptionFailed)
    );
    assert_eq!(bob.decrypt(&m, b"transfer-a").unwrap(), b"chunk");
}

#[test]
fn test_closed_session_refuses_everything() {
    let (mut alice, mut bob) = connected_pair(RatchetConfig::default());
    let m = alice.encrypt(b"x", b"").unwrap();
    alice.close();
    assert_eq!(alice.state(), SessionState::Terminated);
    assert_eq!(
        alice.encrypt(b"y", b"").unwrap_err(),
        CryptoError::SessionTerminated
    );
    assert_eq!(bob.decrypt(&m, b"").unwrap(), b"x");
}
