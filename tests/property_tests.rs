//! Property-based tests for BINLINK
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Envelope Properties
// ============================================================================

mod envelope_properties {
    use super::*;
    use binlink_crypto::{CryptoError, Envelope, EnvelopeKey, open_at, seal_at};

    const T0: u64 = 1_700_000_000;

    proptest! {
        /// Seal then open with the same key inside the window returns the plaintext
        #[test]
        fn envelope_roundtrip(message in ".{0,512}", key in "[a-zA-Z0-9]{1,32}") {
            let key = EnvelopeKey::from_passphrase(&key);
            let envelope = seal_at(&message, &key, T0).unwrap();

            prop_assert_eq!(open_at(&envelope, &key, 30, T0).unwrap(), message.clone());

            // Survives the wire encoding too
            let wire = Envelope::from_wire(envelope.to_wire().as_bytes()).unwrap();
            prop_assert_eq!(open_at(&wire, &key, 30, T0).unwrap(), message);
        }

        /// Any single flipped bit in the ciphertext is rejected
        #[test]
        fn ciphertext_bit_flip_rejected(message in ".{1,256}", bit in any::<prop::sample::Index>()) {
            let key = EnvelopeKey::from_passphrase("K");
            let mut envelope = seal_at(&message, &key, T0).unwrap();

            let bit = bit.index(envelope.ciphertext.len() * 8);
            envelope.ciphertext[bit / 8] ^= 1 << (bit % 8);

            prop_assert!(matches!(
                open_at(&envelope, &key, 30, T0),
                Err(CryptoError::InvalidSignature)
            ));
        }

        /// Any single flipped bit in the signature or IV is rejected
        #[test]
        fn header_bit_flip_rejected(bit in 0usize..(32 * 8), in_iv in any::<bool>()) {
            let key = EnvelopeKey::from_passphrase("K");
            let mut envelope = seal_at("PING", &key, T0).unwrap();

            if in_iv {
                let bit = bit % (16 * 8);
                envelope.nonce[bit / 8] ^= 1 << (bit % 8);
            } else {
                envelope.signature[bit / 8] ^= 1 << (bit % 8);
            }

            prop_assert!(open_at(&envelope, &key, 30, T0).unwrap_err().is_tamper());
        }

        /// Freshness is exactly |now - ts| <= window
        #[test]
        fn freshness_window(offset in -120i64..120, window in 1u64..90) {
            let key = EnvelopeKey::from_passphrase("K");
            let envelope = seal_at("PING", &key, T0).unwrap();
            let now = T0.checked_add_signed(offset).unwrap();

            let result = open_at(&envelope, &key, window, now);
            if offset.unsigned_abs() <= window {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.unwrap_err().is_replay());
            }
        }

        /// A different key never opens the envelope
        #[test]
        fn wrong_key_rejected(a in "[a-z]{1,16}", b in "[a-z]{1,16}") {
            prop_assume!(a != b);
            let envelope = seal_at("GET_STATUS", &EnvelopeKey::from_passphrase(&a), T0).unwrap();
            prop_assert!(open_at(&envelope, &EnvelopeKey::from_passphrase(&b), 30, T0).is_err());
        }
    }
}

// ============================================================================
// Routing Properties
// ============================================================================

mod routing_properties {
    use super::*;
    use binlink_core::Request;
    use binlink_transport::PeerAddress;

    proptest! {
        /// The prefix is everything before the first ':' and never contains one
        #[test]
        fn prefix_split(prefix in "[A-Z_]{1,20}", args in "[ -~]{0,64}") {
            let message = format!("{prefix}:{args}");
            let request = Request::parse(&message, PeerAddress::Serial);

            prop_assert_eq!(&request.command, &prefix);
            prop_assert!(!request.command.contains(':'));
            prop_assert_eq!(request.args, args.trim_end());
        }

        /// A session_key argument is always recovered
        #[test]
        fn session_key_recovered(key in "[0-9a-f]{8,64}", lead in "[0-9]{0,4}") {
            let message = if lead.is_empty() {
                format!("GET_STATUS:session_key={key}")
            } else {
                format!("SET_SERVO_ANGLE:{lead}:session_key={key}")
            };
            let request = Request::parse(&message, PeerAddress::Serial);
            prop_assert_eq!(request.session_key(), Some(key));
        }
    }
}
