#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bridge_core::{
    BridgeEvent, ChannelKind, ChannelState, Credentials, EventEnvelope, EventStream, RetryPolicy,
    SessionConfig,
};
use bridge_runtime::{EngineOp, EngineResponse, SessionEngine};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};

pub const WAIT: Duration = Duration::from_secs(5);

/// Engine double: scripted responses, recorded calls, optional gates.
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<(EngineOp, Value)>>,
    scripted: Mutex<HashMap<EngineOp, VecDeque<EngineResponse>>>,
    polls: Mutex<HashMap<&'static str, VecDeque<EngineResponse>>>,
    gates: Mutex<HashMap<EngineOp, Arc<Semaphore>>>,
    entered: Notify,
    in_flight: AtomicUsize,
    max_in_flight_mutating: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next response for `op`; unscripted calls get a default.
    pub fn script(&self, op: EngineOp, response: EngineResponse) {
        self.scripted
            .lock()
            .expect("script lock")
            .entry(op)
            .or_default()
            .push_back(response);
    }

    /// Queue the next `pollEvents` response of `channel`.
    pub fn script_poll(&self, channel: ChannelKind, response: EngineResponse) {
        self.polls
            .lock()
            .expect("poll lock")
            .entry(channel.as_str())
            .or_default()
            .push_back(response);
    }

    pub fn script_events(&self, channel: ChannelKind, events: Value) {
        self.script_poll(channel, EngineResponse::success(events));
    }

    /// Calls of `op` block until `release` is called.
    pub fn gate(&self, op: EngineOp) {
        self.gates
            .lock()
            .expect("gate lock")
            .insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: EngineOp) {
        if let Some(gate) = self.gates.lock().expect("gate lock").get(&op) {
            gate.add_permits(1);
        }
    }

    /// Wait until a call of `op` has been made.
    pub async fn wait_for_call(&self, op: EngineOp) {
        loop {
            let entered = self.entered.notified();
            if self.count(op) > 0 {
                return;
            }
            entered.await;
        }
    }

    pub fn calls(&self) -> Vec<(EngineOp, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Recorded calls excluding polls.
    pub fn commands(&self) -> Vec<(EngineOp, Value)> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| *op != EngineOp::PollEvents)
            .collect()
    }

    pub fn count(&self, op: EngineOp) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(called, _)| *called == op)
            .count()
    }

    pub fn max_in_flight_mutating(&self) -> usize {
        self.max_in_flight_mutating.load(Ordering::SeqCst)
    }

    fn default_response(op: EngineOp, args: &Value) -> EngineResponse {
        match op {
            EngineOp::NewClient => EngineResponse::success(json!({ "handle": 7 })),
            EngineOp::Connect => EngineResponse::success(json!({
                "user": { "id": 100, "name": "Tester" },
                "initialData": { "threads": [], "messages": [] },
            })),
            EngineOp::SendMessage | EngineOp::SendE2eeMessage => {
                let text = args["options"]["text"]
                    .as_str()
                    .or_else(|| args["text"].as_str())
                    .unwrap_or_default();
                EngineResponse::success(json!({ "messageId": format!("mid.{text}"), "timestampMs": 1 }))
            }
            EngineOp::IsConnected => {
                EngineResponse::success(json!({ "connected": true, "e2eeConnected": false }))
            }
            _ => EngineResponse::success(Value::Null),
        }
    }
}

#[async_trait]
impl SessionEngine for ScriptedEngine {
    async fn call(&self, op: EngineOp, args: Value) -> EngineResponse {
        if op == EngineOp::PollEvents {
            let channel = args["channel"].as_str().unwrap_or("plain").to_owned();
            let next = self
                .polls
                .lock()
                .expect("poll lock")
                .get_mut(channel.as_str())
                .and_then(VecDeque::pop_front);
            self.calls.lock().expect("calls lock").push((op, args));
            return match next {
                Some(response) => response,
                None => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    EngineResponse::success(Value::Null)
                }
            };
        }

        let mutating = op.is_mutating();
        if mutating {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_mutating.fetch_max(now, Ordering::SeqCst);
        }
        self.calls.lock().expect("calls lock").push((op, args.clone()));
        self.entered.notify_waiters();

        let gate = self.gates.lock().expect("gate lock").get(&op).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate open").forget();
        }

        let scripted = self
            .scripted
            .lock()
            .expect("script lock")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if mutating {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        scripted.unwrap_or_else(|| Self::default_response(op, &args))
    }
}

pub fn credentials() -> Credentials {
    Credentials::new().with("c_user", "100").with("xs", "secret")
}

pub fn config() -> SessionConfig {
    SessionConfig {
        poll_timeout_ms: 10,
        reconnect_policy: RetryPolicy::new(5, 20).with_max_attempts(3),
        ..SessionConfig::new(credentials())
    }
}

pub fn event(kind: &str, data: Value) -> Value {
    json!({ "type": kind, "data": data, "timestamp": 1 })
}

/// Next event from `events`, failing the test after `WAIT`.
pub async fn next(events: &mut EventStream) -> EventEnvelope {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event timeout")
        .expect("event stream closed")
}

/// Skip events until `channel` reaches `state`.
pub async fn wait_for_state(events: &mut EventStream, channel: ChannelKind, state: ChannelState) {
    loop {
        let envelope = next(events).await;
        if envelope.channel == channel && envelope.event == (BridgeEvent::StateChanged { state }) {
            return;
        }
    }
}
