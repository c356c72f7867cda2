//! Conversion of raw engine payloads into typed bridge values.

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::{BridgeError, severity_for},
    event::{BridgeEvent, ErrorEvent, EventEnvelope, EventKind},
    types::ChannelKind,
};

/// One undecoded event as the engine reports it.
#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Result of one `pollEvents` call before decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub events: Vec<Value>,
    /// Events the engine discarded because its own queue overflowed.
    pub dropped: u64,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    dropped: u64,
}

/// Accepts `null` (nothing pending), a bare event array, or
/// `{ "events": [...], "dropped": n }`.
pub fn parse_batch(data: Value) -> Result<RawBatch, BridgeError> {
    match data {
        Value::Null => Ok(RawBatch::default()),
        Value::Array(events) => Ok(RawBatch { events, dropped: 0 }),
        object @ Value::Object(_) => {
            let batch: BatchObject = serde_json::from_value(object)
                .map_err(|err| BridgeError::protocol(format!("malformed event batch: {err}")))?;
            Ok(RawBatch {
                events: batch.events,
                dropped: batch.dropped,
            })
        }
        other => Err(BridgeError::protocol(format!(
            "event batch must be an array or object, got {other}"
        ))),
    }
}

/// Decode a whole batch in engine order.
///
/// Undecodable events become transient `error` events in the same position;
/// an engine-reported overflow is announced first.
pub fn decode_batch(channel: ChannelKind, batch: RawBatch, now_ms: i64) -> Vec<EventEnvelope> {
    let mut envelopes = Vec::with_capacity(batch.events.len() + 1);
    if batch.dropped > 0 {
        envelopes.push(EventEnvelope::new(
            channel,
            now_ms,
            BridgeEvent::Error(ErrorEvent::transient(format!(
                "engine dropped {} event(s) on the {channel} channel",
                batch.dropped
            ))),
        ));
    }
    for raw in batch.events {
        let envelope = match decode_event(channel, raw, now_ms) {
            Ok(envelope) => envelope,
            Err(reason) => {
                tracing::warn!(channel = %channel, %reason, "undecodable engine event");
                EventEnvelope::new(
                    channel,
                    now_ms,
                    BridgeEvent::Error(ErrorEvent::transient(format!(
                        "undecodable event: {reason}"
                    ))),
                )
            }
        };
        envelopes.push(envelope);
    }
    envelopes
}

/// Decode one raw engine event.
pub fn decode_event(channel: ChannelKind, raw: Value, now_ms: i64) -> Result<EventEnvelope, String> {
    let raw: RawEvent = serde_json::from_value(raw).map_err(|err| err.to_string())?;
    let kind: EventKind = raw.kind.parse().map_err(|err| format!("{err}"))?;
    let data = raw.data;

    let event = match kind {
        EventKind::Ready => {
            #[derive(Default, Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Ready {
                #[serde(default)]
                is_new_session: bool,
            }
            let ready: Ready = if data.is_null() {
                Ready::default()
            } else {
                payload(kind, data)?
            };
            BridgeEvent::Ready {
                is_new_session: ready.is_new_session,
            }
        }
        EventKind::Reconnected => BridgeEvent::Reconnected,
        EventKind::Disconnected => BridgeEvent::Disconnected,
        EventKind::Error => {
            #[derive(Deserialize)]
            struct RawError {
                #[serde(default)]
                message: String,
                #[serde(default)]
                code: Option<i64>,
                #[serde(default)]
                permanent: Option<bool>,
            }
            let err: RawError = payload(kind, data)?;
            BridgeEvent::Error(ErrorEvent {
                message: err.message,
                code: err.code.filter(|code| *code != 0),
                severity: severity_for(err.code, err.permanent),
            })
        }
        EventKind::Message => BridgeEvent::Message(payload(kind, data)?),
        EventKind::MessageEdit => BridgeEvent::MessageEdit(payload(kind, data)?),
        EventKind::MessageUnsend => BridgeEvent::MessageUnsend(payload(kind, data)?),
        EventKind::Reaction => BridgeEvent::Reaction(payload(kind, data)?),
        EventKind::Typing => BridgeEvent::Typing(payload(kind, data)?),
        EventKind::Presence => BridgeEvent::Presence(payload(kind, data)?),
        EventKind::ReadReceipt => BridgeEvent::ReadReceipt(payload(kind, data)?),
        EventKind::E2eeConnected => BridgeEvent::E2eeConnected,
        EventKind::E2eeMessage => BridgeEvent::E2eeMessage(payload(kind, data)?),
        EventKind::E2eeReaction => BridgeEvent::E2eeReaction(payload(kind, data)?),
        EventKind::E2eeReceipt => BridgeEvent::E2eeReceipt(payload(kind, data)?),
        EventKind::DeviceDataChanged => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct DeviceData {
                device_data: String,
            }
            let device: DeviceData = payload(kind, data)?;
            BridgeEvent::DeviceDataChanged {
                device_data: device.device_data,
            }
        }
        EventKind::StateChanged => {
            return Err("stateChanged is reserved for the bridge".to_owned());
        }
    };

    Ok(EventEnvelope::new(
        channel,
        raw.timestamp.unwrap_or(now_ms),
        event,
    ))
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|err| format!("invalid {kind} payload: {err}"))
}

/// Decode the `data` of a successful engine response for `operation`.
pub fn decode_payload<T: DeserializeOwned>(operation: &str, data: Value) -> Result<T, BridgeError> {
    serde_json::from_value(data).map_err(|err| {
        BridgeError::protocol(format!("unexpected '{operation}' response: {err}"))
    })
}
