//! Property-based tests for ordering and input hardening
//!
//! Uses proptest to check that reordering within the configured bounds
//! never loses or corrupts data, and that received file names are always
//! reduced to one safe path component.

use ferry_core::sanitize::{MAX_FILENAME_BYTES, sanitize_filename};
use ferry_crypto::{CryptoError, RatchetConfig, SessionState};
use ferry_integration_tests::connected_pair;
use ferry_transport::reassembly::Reassembler;
use proptest::prelude::*;

fn permutation(max: usize) -> impl Strategy<Value = Vec<usize>> {
    (1..=max).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

// ============================================================================
// Reassembly
// ============================================================================

proptest! {
    /// Any arrival order inside the window yields the original sequence.
    #[test]
    fn prop_reassembler_restores_order(order in permutation(64)) {
        let mut reassembler = Reassembler::new(64);
        let mut delivered = Vec::new();
        for &seq in &order {
            let out = reassembler.accept(seq as u64, vec![seq as u8]);
            prop_assert!(!out.duplicate);
            delivered.extend(out.ready);
        }
        let expected: Vec<Vec<u8>> = (0..order.len()).map(|i| vec![i as u8]).collect();
        prop_assert_eq!(delivered, expected);
        prop_assert_eq!(reassembler.next_expected(), order.len() as u64);
        prop_assert_eq!(reassembler.pending_len(), 0);
    }

    /// Redelivering a frame is flagged and never re-emitted.
    #[test]
    fn prop_reassembler_drops_duplicates(order in permutation(32), repeat in 0usize..32) {
        let mut reassembler = Reassembler::new(64);
        let mut delivered = 0usize;
        for &seq in &order {
            delivered += reassembler.accept(seq as u64, vec![0]).ready.len();
        }
        let seq = (repeat % order.len()) as u64;
        let again = reassembler.accept(seq, vec![0]);
        prop_assert!(again.duplicate);
        prop_assert!(again.ready.is_empty());
        prop_assert_eq!(delivered, order.len());
    }
}

// ============================================================================
// Ratchet reordering
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Messages of one epoch decrypt in any order when the gap stays within max_skip.
    #[test]
    fn prop_ratchet_accepts_reordering_within_bound(order in permutation(24)) {
        let config = RatchetConfig {
            max_skip: 32,
            epoch_message_threshold: 1000,
            ..RatchetConfig::default()
        };
        let (mut alice, mut bob) = connected_pair(config);
        let msgs: Vec<_> = (0..order.len())
            .map(|i| alice.encrypt(&(i as u32).to_be_bytes(), b"prop").unwrap())
            .collect();
        for &i in &order {
            let plaintext = bob.decrypt(&msgs[i], b"prop").unwrap();
            prop_assert_eq!(plaintext, (i as u32).to_be_bytes().to_vec());
        }
        for &i in &order {
            prop_assert!(bob.decrypt(&msgs[i], b"prop").is_err());
        }
    }

    /// Reordering across epoch boundaries converges once each epoch's
    /// ciphertext has arrived; early messages are retried, never lost.
    #[test]
    fn prop_ratchet_accepts_reordering_across_epochs(order in permutation(20)) {
        let config = RatchetConfig {
            epoch_message_threshold: 5,
            retained_epoch_keys: 4,
            ..RatchetConfig::default()
        };
        let (mut alice, mut bob) = connected_pair(config);
        let msgs: Vec<_> = (0..order.len())
            .map(|i| alice.encrypt(&[i as u8], b"").unwrap())
            .collect();

        let mut waiting: Vec<usize> = Vec::new();
        for &i in &order {
            waiting.push(i);
            loop {
                let before = waiting.len();
                let mut still = Vec::new();
                for &j in &waiting {
                    match bob.decrypt(&msgs[j], b"") {
                        Ok(plaintext) => prop_assert_eq!(plaintext, vec![j as u8]),
                        Err(CryptoError::EpochNotReached { .. }) => still.push(j),
                        Err(e) => return Err(TestCaseError::fail(format!("message {j}: {e}"))),
                    }
                }
                waiting = still;
                if waiting.len() == before {
                    break;
                }
            }
        }
        prop_assert!(waiting.is_empty());
        prop_assert_ne!(bob.state(), SessionState::Terminated);
    }
}

// ============================================================================
// File name sanitization
// ============================================================================

proptest! {
    /// Output is one non-empty component without separators or control characters.
    #[test]
    fn prop_sanitized_name_is_single_component(name in ".{0,400}") {
        let safe = sanitize_filename(&name);
        prop_assert!(!safe.is_empty());
        prop_assert!(safe.len() <= MAX_FILENAME_BYTES);
        prop_assert!(!safe.contains('/'));
        prop_assert!(!safe.contains('\\'));
        prop_assert!(!safe.starts_with('.'));
        prop_assert!(!safe.chars().any(char::is_control));
        prop_assert!(safe != "..");
    }

    /// Traversal prefixes never survive.
    #[test]
    fn prop_traversal_prefix_is_stripped(depth in 1usize..8, stem in "[a-z]{1,12}") {
        let name = format!("{}{stem}.txt", "../".repeat(depth));
        prop_assert_eq!(sanitize_filename(&name), format!("{stem}.txt"));
    }
}
