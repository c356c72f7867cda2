//! In-process engine that echoes outgoing traffic back as events.
//!
//! Speaks the same JSON contract as a real engine, so it can stand in for one
//! behind `BlockingEngine` in smoke runs and tests. Nothing leaves the
//! process.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bridge_core::now_ms;
use serde_json::{Value, json};

use crate::engine::{EngineResponse, JsonEngine};

/// Upper bound for a single `pollEvents` wait.
const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct LoopbackEngine {
    state: Mutex<LoopbackState>,
    pending: Condvar,
}

#[derive(Default)]
struct LoopbackState {
    next_handle: i64,
    clients: HashMap<i64, LoopbackClient>,
}

#[derive(Default)]
struct LoopbackClient {
    account_id: i64,
    plain: bool,
    e2ee: bool,
    device_data: Option<String>,
    plain_queue: VecDeque<Value>,
    e2ee_queue: VecDeque<Value>,
    next_message: u64,
}

impl LoopbackClient {
    fn queue(&mut self, channel: &str) -> &mut VecDeque<Value> {
        if channel == "e2ee" {
            &mut self.e2ee_queue
        } else {
            &mut self.plain_queue
        }
    }

    fn push(&mut self, channel: &str, kind: &str, data: Value) {
        self.queue(channel).push_back(json!({
            "type": kind,
            "data": data,
            "timestamp": now_ms(),
        }));
    }

    fn next_message_id(&mut self, prefix: &str) -> String {
        self.next_message += 1;
        format!("{prefix}.loopback.{}", self.next_message)
    }
}

type OpResult = Result<Value, EngineResponse>;

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, operation: &str, args: Value) -> OpResult {
        if operation == "newClient" {
            return self.new_client(&args);
        }
        if operation == "pollEvents" {
            return self.poll(&args);
        }

        let handle = args["handle"].as_i64().ok_or_else(|| missing("handle"))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| EngineResponse::failure("loopback state poisoned"))?;
        let client = state
            .clients
            .get_mut(&handle)
            .ok_or_else(|| EngineResponse::failure(format!("unknown client handle {handle}")))?;
        let options = &args["options"];

        let result = match operation {
            "connect" => {
                client.plain = true;
                client.push("plain", "ready", json!({ "isNewSession": false }));
                Ok(json!({
                    "user": {
                        "id": client.account_id,
                        "name": "Loopback User",
                        "username": "loopback",
                    },
                    "initialData": { "threads": [], "messages": [] },
                }))
            }
            "connectE2EE" => {
                client.e2ee = true;
                if let Some(device) = args["deviceData"].as_str() {
                    client.device_data = Some(device.to_owned());
                } else {
                    let device = format!("loopback-device-{handle}");
                    client.device_data = Some(device.clone());
                    client.push("e2ee", "deviceDataChanged", json!({ "deviceData": device }));
                }
                client.push("e2ee", "e2eeConnected", Value::Null);
                Ok(json!({}))
            }
            "disconnect" => {
                let channel = args["channel"].as_str().unwrap_or("plain");
                if channel == "e2ee" {
                    client.e2ee = false;
                } else {
                    client.plain = false;
                }
                client.queue(channel).clear();
                Ok(Value::Null)
            }
            "isConnected" => Ok(json!({
                "connected": client.plain,
                "e2eeConnected": client.e2ee,
            })),
            "getDeviceData" => Ok(json!({ "deviceData": client.device_data })),
            _ if operation.contains("E2EE") => Self::e2ee_op(client, operation, &args, options),
            _ => Self::plain_op(client, operation, &args, options),
        };
        drop(state);
        self.pending.notify_all();
        result
    }

    fn new_client(&self, args: &Value) -> OpResult {
        let account_id = args["cookies"]["c_user"]
            .as_str()
            .and_then(|raw| raw.trim().parse().ok())
            .ok_or_else(|| missing("cookies.c_user"))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| EngineResponse::failure("loopback state poisoned"))?;
        state.next_handle += 1;
        let handle = state.next_handle;
        state.clients.insert(
            handle,
            LoopbackClient {
                account_id,
                device_data: args["deviceData"].as_str().map(str::to_owned),
                ..LoopbackClient::default()
            },
        );
        Ok(json!({ "handle": handle }))
    }

    fn plain_op(client: &mut LoopbackClient, operation: &str, args: &Value, options: &Value) -> OpResult {
        if !client.plain {
            return Err(EngineResponse::failure("not connected"));
        }
        let now = now_ms();
        match operation {
            "sendMessage" => {
                let id = client.next_message_id("mid");
                let thread_id = options["threadId"].as_i64().ok_or_else(|| missing("threadId"))?;
                client.push(
                    "plain",
                    "message",
                    json!({
                        "id": id,
                        "threadId": thread_id,
                        "senderId": client.account_id,
                        "text": options["text"],
                        "timestampMs": now,
                    }),
                );
                Ok(json!({ "messageId": id, "timestampMs": now }))
            }
            "sendReaction" => {
                client.push(
                    "plain",
                    "reaction",
                    json!({
                        "messageId": args["messageId"],
                        "threadId": args["threadId"],
                        "actorId": client.account_id,
                        "reaction": args["emoji"],
                        "timestampMs": now,
                    }),
                );
                Ok(Value::Null)
            }
            "editMessage" => {
                client.push(
                    "plain",
                    "messageEdit",
                    json!({ "messageId": args["messageId"], "newText": args["newText"] }),
                );
                Ok(Value::Null)
            }
            "unsendMessage" => {
                client.push(
                    "plain",
                    "messageUnsend",
                    json!({ "messageId": args["messageId"], "threadId": 0 }),
                );
                Ok(Value::Null)
            }
            "sendImage" | "sendVideo" | "sendVoice" | "sendFile" | "sendSticker" => {
                let id = client.next_message_id("mid");
                Ok(json!({ "messageId": id, "timestampMs": now }))
            }
            "uploadMedia" => {
                let id = client.next_message_id("fb");
                Ok(json!({
                    "fbId": 1_000_000 + client.next_message as i64,
                    "filename": options["filename"].as_str().unwrap_or(&id),
                }))
            }
            "createThread" => Ok(json!({ "threadId": options["userId"] })),
            "getUserInfo" => Ok(json!({
                "id": options["userId"],
                "name": format!("User {}", options["userId"]),
            })),
            "searchUsers" => Ok(json!({
                "users": [{ "id": 1_000, "name": options["query"], "username": options["query"] }],
            })),
            "sendTyping" | "markRead" | "setGroupPhoto" | "renameThread" | "muteThread"
            | "deleteThread" => Ok(Value::Null),
            other => Err(EngineResponse::failure(format!("unknown operation {other}"))),
        }
    }

    fn e2ee_op(client: &mut LoopbackClient, operation: &str, args: &Value, options: &Value) -> OpResult {
        if !client.e2ee {
            return Err(EngineResponse::failure("E2EE not connected"));
        }
        let now = now_ms();
        let self_jid = format!("{}@msgr.fb", client.account_id);
        match operation {
            "sendE2EEMessage" => {
                let id = client.next_message_id("e2ee");
                client.push(
                    "e2ee",
                    "e2eeMessage",
                    json!({
                        "id": id,
                        "chatJid": args["chatJid"],
                        "senderJid": self_jid,
                        "senderId": client.account_id,
                        "text": args["text"],
                        "timestampMs": now,
                    }),
                );
                Ok(json!({ "messageId": id, "timestampMs": now }))
            }
            "sendE2EEReaction" => {
                client.push(
                    "e2ee",
                    "e2eeReaction",
                    json!({
                        "messageId": args["messageId"],
                        "chatJid": args["chatJid"],
                        "senderJid": self_jid,
                        "reaction": args["emoji"],
                    }),
                );
                Ok(Value::Null)
            }
            "sendE2EEImage" | "sendE2EEVideo" | "sendE2EEAudio" | "sendE2EEDocument"
            | "sendE2EESticker" => {
                let id = client.next_message_id("e2ee");
                Ok(json!({ "messageId": id, "timestampMs": now }))
            }
            "downloadE2EEMedia" => Ok(json!({
                "data": STANDARD.encode(options["directPath"].as_str().unwrap_or_default()),
                "mimeType": options["mimeType"],
                "fileSize": options["fileSize"],
            })),
            "sendE2EETyping" | "editE2EEMessage" | "unsendE2EEMessage" => Ok(Value::Null),
            other => Err(EngineResponse::failure(format!("unknown operation {other}"))),
        }
    }

    /// Wait up to `timeoutMs` for queued events on one channel.
    fn poll(&self, args: &Value) -> OpResult {
        let handle = args["handle"].as_i64().ok_or_else(|| missing("handle"))?;
        let channel = args["channel"].as_str().unwrap_or("plain").to_owned();
        let wait = Duration::from_millis(args["timeoutMs"].as_u64().unwrap_or(0)).min(MAX_POLL_WAIT);

        let state = self
            .state
            .lock()
            .map_err(|_| EngineResponse::failure("loopback state poisoned"))?;
        let (mut state, _) = self
            .pending
            .wait_timeout_while(state, wait, |state| {
                state
                    .clients
                    .get_mut(&handle)
                    .is_some_and(|client| client.queue(&channel).is_empty())
            })
            .map_err(|_| EngineResponse::failure("loopback state poisoned"))?;

        let client = state
            .clients
            .get_mut(&handle)
            .ok_or_else(|| EngineResponse::failure(format!("unknown client handle {handle}")))?;
        let events: Vec<Value> = client.queue(&channel).drain(..).collect();
        if events.is_empty() {
            return Ok(Value::Null);
        }
        Ok(Value::Array(events))
    }
}

fn missing(field: &str) -> EngineResponse {
    EngineResponse::failure(format!("missing argument '{field}'"))
}

impl JsonEngine for LoopbackEngine {
    fn call(&self, operation: &str, input: &str) -> String {
        let response = match serde_json::from_str::<Value>(input) {
            Ok(args) => match self.handle(operation, args) {
                Ok(data) => EngineResponse::success(data),
                Err(failure) => failure,
            },
            Err(err) => EngineResponse::failure(format!("invalid input: {err}")),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|err| format!(r#"{{"ok":false,"error":"encode failed: {err}"}}"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(engine: &LoopbackEngine, op: &str, args: Value) -> EngineResponse {
        serde_json::from_str(&engine.call(op, &args.to_string())).expect("engine response")
    }

    #[test]
    fn echoes_sent_messages_as_events() {
        let engine = LoopbackEngine::new();
        let created = call(&engine, "newClient", json!({ "cookies": { "c_user": "42", "xs": "x" } }));
        let handle = created.data["handle"].as_i64().expect("handle");

        let connected = call(&engine, "connect", json!({ "handle": handle }));
        assert!(connected.ok);
        assert_eq!(connected.data["user"]["id"], 42);

        let sent = call(
            &engine,
            "sendMessage",
            json!({ "handle": handle, "options": { "threadId": 7, "text": "hello" } }),
        );
        assert!(sent.ok);

        let polled = call(
            &engine,
            "pollEvents",
            json!({ "handle": handle, "channel": "plain", "timeoutMs": 10 }),
        );
        let events = polled.data.as_array().expect("event array");
        assert_eq!(events[0]["type"], "ready");
        assert_eq!(events[1]["type"], "message");
        assert_eq!(events[1]["data"]["text"], "hello");
    }

    #[test]
    fn rejects_commands_on_unconnected_channels() {
        let engine = LoopbackEngine::new();
        let created = call(&engine, "newClient", json!({ "cookies": { "c_user": "1", "xs": "x" } }));
        let handle = created.data["handle"].as_i64().expect("handle");

        let response = call(
            &engine,
            "sendE2EEMessage",
            json!({ "handle": handle, "chatJid": "2@msgr.fb", "text": "hi" }),
        );
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("E2EE not connected"));

        let empty = call(
            &engine,
            "pollEvents",
            json!({ "handle": handle, "channel": "e2ee", "timeoutMs": 0 }),
        );
        assert!(empty.ok);
        assert_eq!(empty.data, Value::Null);
    }

    #[test]
    fn malformed_input_is_a_failure_response() {
        let engine = LoopbackEngine::new();
        let response: EngineResponse =
            serde_json::from_str(&engine.call("connect", "not json")).expect("response");
        assert!(!response.ok);
    }
}
