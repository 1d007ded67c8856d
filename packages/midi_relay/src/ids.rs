//! Session keys and participant identities.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_base36(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect()
}

/// Opaque key naming one relay group. Equal keys share a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an existing key. Returns `None` for an empty or blank key.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// A fresh random key: 26 lowercase base-36 characters.
    pub fn generate() -> Self {
        let mut key = random_base36(13);
        key.push_str(&random_base36(13));
        Self(key)
    }

    /// Channel topic every participant of this session subscribes to.
    pub fn topic(&self) -> String {
        format!("midi-session-{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one participant process.
///
/// Generated once and kept for the whole process lifetime so that presence
/// entries stay stable across reconnects. Never used for authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn generate() -> Self {
        Self(format!("user_{}", random_base36(13)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_key_shape() {
        let key = SessionKey::generate();
        assert_eq!(key.as_str().len(), 26);
        assert!(
            key.as_str()
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
        );
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(SessionKey::generate(), SessionKey::generate());
    }

    #[test]
    fn blank_session_key_rejected() {
        assert!(SessionKey::new("").is_none());
        assert!(SessionKey::new("   ").is_none());
        assert_eq!(SessionKey::new(" abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn topic_includes_key() {
        let key = SessionKey::new("jam42").unwrap();
        assert_eq!(key.topic(), "midi-session-jam42");
    }

    #[test]
    fn participant_id_shape() {
        let id = ParticipantId::generate();
        assert!(id.as_str().starts_with("user_"));
        assert_eq!(id.as_str().len(), "user_".len() + 13);
    }
}
