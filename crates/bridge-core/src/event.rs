use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::types::{ChannelKind, ChannelState, E2eeMessage, Message};

/// Closed tag set of every event a subscriber can observe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Ready,
    Reconnected,
    Disconnected,
    Error,
    Message,
    MessageEdit,
    MessageUnsend,
    Reaction,
    Typing,
    Presence,
    ReadReceipt,
    #[serde(rename = "e2eeConnected")]
    E2eeConnected,
    #[serde(rename = "e2eeMessage")]
    E2eeMessage,
    #[serde(rename = "e2eeReaction")]
    E2eeReaction,
    #[serde(rename = "e2eeReceipt")]
    E2eeReceipt,
    DeviceDataChanged,
    /// Produced by the bridge itself on every channel state transition.
    StateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::Ready,
        EventKind::Reconnected,
        EventKind::Disconnected,
        EventKind::Error,
        EventKind::Message,
        EventKind::MessageEdit,
        EventKind::MessageUnsend,
        EventKind::Reaction,
        EventKind::Typing,
        EventKind::Presence,
        EventKind::ReadReceipt,
        EventKind::E2eeConnected,
        EventKind::E2eeMessage,
        EventKind::E2eeReaction,
        EventKind::E2eeReceipt,
        EventKind::DeviceDataChanged,
        EventKind::StateChanged,
    ];

    /// Wire tag, as used by the engine's event batches.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Reconnected => "reconnected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Message => "message",
            Self::MessageEdit => "messageEdit",
            Self::MessageUnsend => "messageUnsend",
            Self::Reaction => "reaction",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::ReadReceipt => "readReceipt",
            Self::E2eeConnected => "e2eeConnected",
            Self::E2eeMessage => "e2eeMessage",
            Self::E2eeReaction => "e2eeReaction",
            Self::E2eeReceipt => "e2eeReceipt",
            Self::DeviceDataChanged => "deviceDataChanged",
            Self::StateChanged => "stateChanged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Tag that is not part of the closed event set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_tag() == tag)
            .ok_or_else(|| UnknownEventKind(tag.to_owned()))
    }
}

/// Severity attached to `error` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// The loop keeps running; a retry may succeed.
    Transient,
    /// The session is irrecoverably invalid; the channel stops.
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub severity: ErrorSeverity,
}

impl ErrorEvent {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            severity: ErrorSeverity::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.severity == ErrorSeverity::Permanent
    }
}

/// Numeric thread id on the plain channel, chat JID on the E2EE channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ThreadKey {
    Id(i64),
    Jid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdit {
    pub message_id: String,
    /// Zero when the engine cannot resolve the thread.
    #[serde(default)]
    pub thread_id: i64,
    pub new_text: String,
    #[serde(default)]
    pub edit_count: Option<i64>,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageUnsend {
    pub message_id: String,
    pub thread_id: ThreadKey,
    #[serde(default, rename = "isE2EE")]
    pub is_e2ee: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: String,
    pub thread_id: i64,
    pub actor_id: i64,
    /// Empty when the reaction was removed.
    #[serde(default)]
    pub reaction: String,
    #[serde(default)]
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub thread_id: i64,
    pub sender_id: i64,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: i64,
    pub is_active: bool,
    #[serde(default)]
    pub last_active_timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub thread_id: i64,
    pub reader_id: i64,
    pub read_watermark_timestamp_ms: i64,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct E2eeReaction {
    pub message_id: String,
    pub chat_jid: String,
    pub sender_jid: String,
    #[serde(default)]
    pub sender_id: Option<i64>,
    /// Empty when the reaction was removed.
    #[serde(default)]
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct E2eeReceipt {
    #[serde(rename = "type")]
    pub receipt_type: String,
    pub chat: String,
    pub sender: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

/// Typed notification; the payload shape is fixed by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Ready { is_new_session: bool },
    Reconnected,
    /// The engine severed the channel the envelope belongs to.
    Disconnected,
    Error(ErrorEvent),
    Message(Message),
    MessageEdit(MessageEdit),
    MessageUnsend(MessageUnsend),
    Reaction(Reaction),
    Typing(Typing),
    Presence(Presence),
    ReadReceipt(ReadReceipt),
    E2eeConnected,
    E2eeMessage(E2eeMessage),
    E2eeReaction(E2eeReaction),
    E2eeReceipt(E2eeReceipt),
    DeviceDataChanged { device_data: String },
    StateChanged { state: ChannelState },
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::Reconnected => EventKind::Reconnected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Error(_) => EventKind::Error,
            Self::Message(_) => EventKind::Message,
            Self::MessageEdit(_) => EventKind::MessageEdit,
            Self::MessageUnsend(_) => EventKind::MessageUnsend,
            Self::Reaction(_) => EventKind::Reaction,
            Self::Typing(_) => EventKind::Typing,
            Self::Presence(_) => EventKind::Presence,
            Self::ReadReceipt(_) => EventKind::ReadReceipt,
            Self::E2eeConnected => EventKind::E2eeConnected,
            Self::E2eeMessage(_) => EventKind::E2eeMessage,
            Self::E2eeReaction(_) => EventKind::E2eeReaction,
            Self::E2eeReceipt(_) => EventKind::E2eeReceipt,
            Self::DeviceDataChanged { .. } => EventKind::DeviceDataChanged,
            Self::StateChanged { .. } => EventKind::StateChanged,
        }
    }
}

/// Event plus the channel it was observed on and its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub channel: ChannelKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub event: BridgeEvent,
}

impl EventEnvelope {
    pub fn new(channel: ChannelKind, timestamp_ms: i64, event: BridgeEvent) -> Self {
        Self {
            channel,
            timestamp_ms,
            event,
        }
    }

    /// Envelope stamped with the current wall-clock time.
    pub fn now(channel: ChannelKind, event: BridgeEvent) -> Self {
        Self::new(channel, now_ms(), event)
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_from_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_tag().parse::<EventKind>(), Ok(kind));
        }
        assert_eq!(
            "presenceV2".parse::<EventKind>(),
            Err(UnknownEventKind("presenceV2".into()))
        );
    }

    #[test]
    fn serde_tags_match_wire_tags() {
        for kind in EventKind::ALL {
            let encoded = serde_json::to_value(kind).expect("kind should serialize");
            assert_eq!(encoded, serde_json::Value::String(kind.as_tag().to_owned()));
        }
    }

    #[test]
    fn thread_key_accepts_numbers_and_jids() {
        let plain: MessageUnsend =
            serde_json::from_value(serde_json::json!({ "messageId": "m1", "threadId": 42 }))
                .expect("numeric thread id");
        assert_eq!(plain.thread_id, ThreadKey::Id(42));

        let e2ee: MessageUnsend = serde_json::from_value(serde_json::json!({
            "messageId": "m2",
            "threadId": "123@msgr",
            "isE2EE": true
        }))
        .expect("jid thread id");
        assert_eq!(e2ee.thread_id, ThreadKey::Jid("123@msgr".into()));
        assert!(e2ee.is_e2ee);
    }
}
