use proptest::prelude::*;
use serde_json::json;

use midi_relay::connection::{ConnectionEvent, ConnectionStateMachine, Effect, ReconnectPolicy};
use midi_relay::envelope::{self, format_midi_bytes};
use midi_relay::presence::{PresenceSignal, PresenceTracker};
use midi_relay::{ConnectionState, MidiEventEnvelope, ParticipantId, PresenceMeta, SessionError};

// --- Envelope codec ---

fn arb_participant() -> impl Strategy<Value = ParticipantId> {
    "user_[0-9a-z]{13}".prop_map(ParticipantId::from)
}

fn arb_midi_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..=3)
}

proptest! {
    #[test]
    fn decode_inverts_encode(
        sender in arb_participant(),
        bytes in arb_midi_bytes(),
        sent_at in any::<u64>(),
    ) {
        let original = MidiEventEnvelope::new(sender, bytes, sent_at).unwrap();
        let decoded = envelope::decode(&envelope::encode(&original)).unwrap();
        prop_assert_eq!(decoded, original);
    }

    #[test]
    fn out_of_range_byte_is_malformed(bad in 256u32..100_000, sent_at in any::<u32>()) {
        let payload = json!({ "senderId": "user_a", "payload": [144, bad], "sentAtMillis": sent_at });
        prop_assert!(envelope::decode(&payload).is_err());
    }

    #[test]
    fn hex_rendering_has_one_token_per_byte(bytes in prop::collection::vec(any::<u8>(), 1..16)) {
        let rendered = format_midi_bytes(&bytes);
        prop_assert!(rendered.starts_with('[') && rendered.ends_with(']'));
        let tokens: Vec<&str> = rendered[1..rendered.len() - 1].split(' ').collect();
        prop_assert_eq!(tokens.len(), bytes.len());
        for (token, byte) in tokens.iter().zip(&bytes) {
            prop_assert_eq!(u8::from_str_radix(token, 16).unwrap(), *byte);
        }
    }
}

// --- Backoff ---

proptest! {
    #[test]
    fn backoff_is_non_decreasing(attempt in 1u32..64) {
        let policy = ReconnectPolicy::default();
        prop_assert!(policy.delay_for(attempt + 1) >= policy.delay_for(attempt));
    }

    /// However failures and timer firings interleave, the machine never
    /// schedules more reconnects than the budget between two successes.
    #[test]
    fn attempts_never_exceed_budget(script in prop::collection::vec(0u8..4, 0..80)) {
        let mut machine = ConnectionStateMachine::default();
        machine.handle(ConnectionEvent::Start);
        let mut scheduled_since_success = 0u32;

        for step in script {
            let event = match step {
                0 => ConnectionEvent::Failure(SessionError::ChannelError("reset".into())),
                1 => ConnectionEvent::Failure(SessionError::TimedOut),
                2 => ConnectionEvent::ReconnectDue,
                _ => ConnectionEvent::Subscribed,
            };
            let was_connecting = machine.state() == ConnectionState::Connecting;
            let is_subscribe = matches!(event, ConnectionEvent::Subscribed);
            let effects = machine.handle(event);

            if is_subscribe && was_connecting {
                scheduled_since_success = 0;
            }
            scheduled_since_success += effects
                .iter()
                .filter(|e| matches!(e, Effect::ScheduleReconnect(_)))
                .count() as u32;

            prop_assert!(scheduled_since_success <= 5);
            prop_assert!(machine.attempts_used() <= 5);
            if machine.state() == ConnectionState::Failed {
                prop_assert!(!machine.reconnect_pending());
            }
        }
    }
}

// --- Presence ---

proptest! {
    /// The count always equals the size of the last sync, regardless of how
    /// many join and leave signals arrive in between.
    #[test]
    fn count_follows_last_sync(
        sizes in prop::collection::vec(0usize..20, 1..8),
        noise in prop::collection::vec(any::<bool>(), 0..20),
    ) {
        let mut tracker = PresenceTracker::new();
        for size in &sizes {
            let snapshot = (0..*size)
                .map(|i| {
                    let id = ParticipantId::from(format!("user_{i}"));
                    (id.clone(), PresenceMeta::now(&id))
                })
                .collect();
            tracker.apply(PresenceSignal::Sync(snapshot));
            for join in &noise {
                let key = ParticipantId::from("user_noise");
                let signal = if *join {
                    PresenceSignal::Join { key }
                } else {
                    PresenceSignal::Leave { key }
                };
                prop_assert_eq!(tracker.apply(signal).count, None);
            }
            prop_assert_eq!(tracker.count(), *size);
        }
    }
}
