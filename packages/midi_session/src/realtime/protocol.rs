//! Wire messages of the hosted backend's websocket protocol (Phoenix
//! channels, serializer `1.0.0`).
//!
//! Every frame is one JSON object:
//!
//! ```json
//! { "topic": "realtime:midi-session-abc", "event": "phx_join", "payload": {}, "ref": "1" }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use midi_relay::{ParticipantId, PresenceMeta};

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const BROADCAST: &str = "broadcast";
pub const PRESENCE: &str = "presence";
pub const PRESENCE_STATE: &str = "presence_state";
pub const PRESENCE_DIFF: &str = "presence_diff";
pub const SYSTEM: &str = "system";

/// Topic the socket-level heartbeat is sent on.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Channel topic for an application topic.
pub fn channel_topic(topic: &str) -> String {
    format!("realtime:{topic}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn join(topic: &str, participant: &ParticipantId, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: PHX_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": participant.as_str() },
                }
            }),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn leave(topic: &str, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: PHX_LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn broadcast(topic: &str, event: &str, payload: Value, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: BROADCAST.to_string(),
            payload: json!({ "type": BROADCAST, "event": event, "payload": payload }),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn track(topic: &str, meta: &PresenceMeta, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: PRESENCE.to_string(),
            payload: json!({ "type": PRESENCE, "event": "track", "payload": meta }),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and `Value`s cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One presence entry as the server reports it: `{ "metas": [ {..}, .. ] }`.
#[derive(Debug, Clone, Deserialize)]
struct PresenceEntry {
    #[serde(default)]
    metas: Vec<Value>,
}

/// One connection under a presence key.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRef {
    pub phx_ref: Option<String>,
    pub meta: PresenceMeta,
}

impl PresenceRef {
    /// Stand-in for an entry the server sent without metas.
    pub fn anonymous(key: &str) -> Self {
        Self {
            phx_ref: None,
            meta: PresenceMeta {
                participant_id: Some(ParticipantId::from(key)),
                joined_at_iso: String::new(),
            },
        }
    }

    fn parse(key: &str, value: &Value) -> Self {
        let phx_ref = value
            .get("phx_ref")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut meta = serde_json::from_value::<PresenceMeta>(value.clone())
            .unwrap_or_else(|_| Self::anonymous(key).meta);
        if meta.participant_id.is_none() {
            meta.participant_id = Some(ParticipantId::from(key));
        }
        Self { phx_ref, meta }
    }
}

/// Presence key to the connections listed for it.
pub type PresenceEntries = BTreeMap<String, Vec<PresenceRef>>;

#[derive(Debug, Clone, Default, Deserialize)]
struct PresenceDiffPayload {
    #[serde(default)]
    joins: BTreeMap<String, PresenceEntry>,
    #[serde(default)]
    leaves: BTreeMap<String, PresenceEntry>,
}

/// A frame for this channel, interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Reply {
        msg_ref: Option<String>,
        ok: bool,
        reason: String,
    },
    Broadcast {
        event: String,
        payload: Value,
    },
    PresenceState(PresenceEntries),
    PresenceDiff {
        joins: PresenceEntries,
        leaves: PresenceEntries,
    },
    Error(String),
    Closed,
    Ignored,
}

impl ServerFrame {
    /// Interpret a frame. Frames for other topics are ignored.
    pub fn from_message(topic: &str, message: PhoenixMessage) -> Self {
        if message.topic != topic {
            return Self::Ignored;
        }
        match message.event.as_str() {
            PHX_REPLY => {
                let status = message.payload.get("status").and_then(Value::as_str);
                let reason = message
                    .payload
                    .get("response")
                    .and_then(|r| r.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("join refused")
                    .to_string();
                Self::Reply {
                    msg_ref: message.msg_ref,
                    ok: status == Some("ok"),
                    reason,
                }
            }
            BROADCAST => {
                let event = message.payload.get("event").and_then(Value::as_str);
                match event {
                    Some(event) => Self::Broadcast {
                        event: event.to_string(),
                        payload: message.payload.get("payload").cloned().unwrap_or(Value::Null),
                    },
                    None => Self::Ignored,
                }
            }
            PRESENCE_STATE => {
                let entries: BTreeMap<String, PresenceEntry> =
                    serde_json::from_value(message.payload).unwrap_or_default();
                Self::PresenceState(parse_entries(entries))
            }
            PRESENCE_DIFF => {
                let diff: PresenceDiffPayload =
                    serde_json::from_value(message.payload).unwrap_or_default();
                Self::PresenceDiff {
                    joins: parse_entries(diff.joins),
                    leaves: parse_entries(diff.leaves),
                }
            }
            PHX_ERROR => Self::Error("channel crashed on the server".to_string()),
            PHX_CLOSE => Self::Closed,
            SYSTEM => {
                let status = message.payload.get("status").and_then(Value::as_str);
                if status == Some("error") {
                    let text = message
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("system error")
                        .to_string();
                    Self::Error(text)
                } else {
                    Self::Ignored
                }
            }
            _ => Self::Ignored,
        }
    }
}

fn parse_entries(entries: BTreeMap<String, PresenceEntry>) -> PresenceEntries {
    entries
        .into_iter()
        .map(|(key, entry)| {
            let refs = entry.metas.iter().map(|m| PresenceRef::parse(&key, m)).collect();
            (key, refs)
        })
        .collect()
}

/// Websocket endpoint for a project URL.
///
/// `https://project.example.co` becomes
/// `wss://project.example.co/realtime/v1/websocket?apikey=KEY&vsn=1.0.0`.
pub fn socket_url(base: &str, api_key: &str) -> Option<String> {
    let base = base.trim().trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return None;
    };
    Some(format!(
        "{rest}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "realtime:midi-session-abc";

    fn frame(text: &str) -> ServerFrame {
        ServerFrame::from_message(TOPIC, PhoenixMessage::parse(text).unwrap())
    }

    #[test]
    fn join_carries_presence_key() {
        let msg = PhoenixMessage::join(TOPIC, &ParticipantId::from("user_a"), "1".into());
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "1");
        assert_eq!(value["payload"]["config"]["presence"]["key"], "user_a");
        assert_eq!(value["payload"]["config"]["broadcast"]["self"], false);
    }

    #[test]
    fn broadcast_wraps_payload() {
        let msg = PhoenixMessage::broadcast(TOPIC, "midi-message", json!({"x": 1}), "7".into());
        assert_eq!(msg.event, "broadcast");
        assert_eq!(msg.payload["type"], "broadcast");
        assert_eq!(msg.payload["event"], "midi-message");
        assert_eq!(msg.payload["payload"]["x"], 1);
    }

    #[test]
    fn heartbeat_uses_phoenix_topic() {
        let msg = PhoenixMessage::heartbeat("3".into());
        assert_eq!(msg.topic, "phoenix");
        assert_eq!(msg.event, "heartbeat");
    }

    #[test]
    fn reply_ok_and_error() {
        let ok = frame(r#"{"topic":"realtime:midi-session-abc","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#);
        assert_eq!(
            ok,
            ServerFrame::Reply {
                msg_ref: Some("1".into()),
                ok: true,
                reason: "join refused".into()
            }
        );

        let err = frame(r#"{"topic":"realtime:midi-session-abc","event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#);
        assert!(matches!(err, ServerFrame::Reply { ok: false, ref reason, .. } if reason == "unauthorized"));
    }

    #[test]
    fn broadcast_frame_unwraps_event() {
        let f = frame(r#"{"topic":"realtime:midi-session-abc","event":"broadcast","payload":{"type":"broadcast","event":"midi-message","payload":{"senderId":"user_b"}},"ref":null}"#);
        assert_eq!(
            f,
            ServerFrame::Broadcast {
                event: "midi-message".into(),
                payload: json!({"senderId": "user_b"})
            }
        );
    }

    #[test]
    fn presence_state_and_diff() {
        let state = frame(r#"{"topic":"realtime:midi-session-abc","event":"presence_state","payload":{"user_a":{"metas":[{"phx_ref":"x","userId":"user_a","joinedAt":"2024-01-01T00:00:00Z"}]},"user_b":{"metas":[]}},"ref":null}"#);
        match state {
            ServerFrame::PresenceState(members) => {
                assert_eq!(members.len(), 2);
                let a = &members["user_a"][0];
                assert_eq!(a.phx_ref.as_deref(), Some("x"));
                assert_eq!(a.meta.joined_at_iso, "2024-01-01T00:00:00Z");
                assert_eq!(a.meta.participant_id, Some(ParticipantId::from("user_a")));
                assert!(members["user_b"].is_empty());
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let diff = frame(r#"{"topic":"realtime:midi-session-abc","event":"presence_diff","payload":{"joins":{"user_c":{"metas":[{}]}},"leaves":{"user_a":{"metas":[{"phx_ref":"x"}]}}},"ref":null}"#);
        match diff {
            ServerFrame::PresenceDiff { joins, leaves } => {
                assert_eq!(
                    joins["user_c"],
                    vec![PresenceRef::anonymous("user_c")]
                );
                assert_eq!(leaves["user_a"][0].phx_ref.as_deref(), Some("x"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn other_topics_and_events_are_ignored() {
        let f = frame(r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#);
        assert_eq!(f, ServerFrame::Ignored);
        let f = frame(r#"{"topic":"realtime:midi-session-abc","event":"postgres_changes","payload":{}}"#);
        assert_eq!(f, ServerFrame::Ignored);
    }

    #[test]
    fn system_error_and_close() {
        let f = frame(r#"{"topic":"realtime:midi-session-abc","event":"system","payload":{"status":"error","message":"quota exceeded"}}"#);
        assert_eq!(f, ServerFrame::Error("quota exceeded".into()));
        let f = frame(r#"{"topic":"realtime:midi-session-abc","event":"phx_close","payload":{}}"#);
        assert_eq!(f, ServerFrame::Closed);
    }

    #[test]
    fn socket_url_schemes() {
        assert_eq!(
            socket_url("https://demo.supabase.co/", "anon").as_deref(),
            Some("wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0")
        );
        assert_eq!(
            socket_url("http://localhost:54321", "k").as_deref(),
            Some("ws://localhost:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0")
        );
        assert!(socket_url("ftp://nope", "k").is_none());
    }
}
