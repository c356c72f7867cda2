use std::sync::{Arc, Mutex, MutexGuard};

use bridge_core::{
    BridgeError, BridgeEvent, ChannelKind, ChannelState, ChannelStateMachine, ErrorEvent,
    EventDispatcher, EventEnvelope, InitialSync, SessionConfig,
};
use bridge_platform::DeviceIdentity;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{EngineOp, SessionEngine},
    gateway::PendingCommand,
    registry::SessionHandle,
};

/// Per-channel mutable state.
pub(crate) struct ChannelSlot {
    pub(crate) machine: ChannelStateMachine,
    state_tx: watch::Sender<ChannelState>,
    pub(crate) poller: Option<CancellationToken>,
    pub(crate) reconnect: Option<CancellationToken>,
    pub(crate) initial_sync: Option<InitialSync>,
}

impl ChannelSlot {
    fn new(channel: ChannelKind) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            machine: ChannelStateMachine::new(channel),
            state_tx,
            poller: None,
            reconnect: None,
            initial_sync: None,
        }
    }

    /// Cancel the poller and any reconnect sequence.
    pub(crate) fn stop_tasks(&mut self) {
        if let Some(token) = self.poller.take() {
            token.cancel();
        }
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }
}

pub(crate) struct SessionRecord {
    plain: ChannelSlot,
    e2ee: ChannelSlot,
    pub(crate) last_error: Option<BridgeError>,
    pub(crate) destroyed: bool,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            plain: ChannelSlot::new(ChannelKind::Plain),
            e2ee: ChannelSlot::new(ChannelKind::E2ee),
            last_error: None,
            destroyed: false,
        }
    }

    pub(crate) fn slot(&mut self, channel: ChannelKind) -> &mut ChannelSlot {
        match channel {
            ChannelKind::Plain => &mut self.plain,
            ChannelKind::E2ee => &mut self.e2ee,
        }
    }

    pub(crate) fn slot_ref(&self, channel: ChannelKind) -> &ChannelSlot {
        match channel {
            ChannelKind::Plain => &self.plain,
            ChannelKind::E2ee => &self.e2ee,
        }
    }
}

/// Everything one live session owns, shared by its tasks.
pub(crate) struct SessionShared {
    pub(crate) handle: SessionHandle,
    pub(crate) engine_handle: i64,
    pub(crate) config: SessionConfig,
    pub(crate) engine: Arc<dyn SessionEngine>,
    /// Engine lane: mutating calls write, polls and lookups read.
    pub(crate) lane: RwLock<()>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) identity: DeviceIdentity,
    pub(crate) shutdown: CancellationToken,
    pub(crate) commands: mpsc::Sender<PendingCommand>,
    record: Mutex<SessionRecord>,
}

impl SessionShared {
    pub(crate) fn new(
        handle: SessionHandle,
        engine_handle: i64,
        config: SessionConfig,
        engine: Arc<dyn SessionEngine>,
        identity: DeviceIdentity,
        commands: mpsc::Sender<PendingCommand>,
    ) -> Self {
        Self {
            handle,
            engine_handle,
            config,
            engine,
            lane: RwLock::new(()),
            dispatcher: EventDispatcher::new(),
            identity,
            shutdown: CancellationToken::new(),
            commands,
            record: Mutex::new(SessionRecord::new()),
        }
    }

    /// Lock the record. Never held across `.await`.
    pub(crate) fn record(&self) -> Result<MutexGuard<'_, SessionRecord>, BridgeError> {
        self.record
            .lock()
            .map_err(|_| BridgeError::internal("session record lock poisoned"))
    }

    pub(crate) fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.record()?.destroyed {
            return Err(BridgeError::unknown_handle(self.handle));
        }
        Ok(())
    }

    pub(crate) fn channel_state(&self, channel: ChannelKind) -> Result<ChannelState, BridgeError> {
        Ok(self.record()?.slot_ref(channel).machine.state())
    }

    pub(crate) fn watch_state(
        &self,
        channel: ChannelKind,
    ) -> Result<watch::Receiver<ChannelState>, BridgeError> {
        Ok(self.record()?.slot_ref(channel).state_tx.subscribe())
    }

    /// Apply a state-machine step and publish its `stateChanged` event while
    /// the record is still locked, so transitions are observed in order.
    pub(crate) fn transition<T, F>(&self, channel: ChannelKind, step: F) -> Result<T, BridgeError>
    where
        F: FnOnce(&mut SessionRecord) -> Result<(T, Option<BridgeEvent>), BridgeError>,
    {
        let mut record = self.record()?;
        let (value, event) = step(&mut *record)?;
        if let Some(event) = event {
            self.publish_locked(&mut *record, channel, event);
        }
        Ok(value)
    }

    /// Publish a state-change event produced under an already held lock.
    pub(crate) fn publish_locked(
        &self,
        record: &mut SessionRecord,
        channel: ChannelKind,
        event: BridgeEvent,
    ) {
        let slot = record.slot(channel);
        let state = slot.machine.state();
        slot.state_tx.send_replace(state);
        tracing::debug!(
            handle = %self.handle,
            channel = %channel,
            state = ?state,
            "channel state changed"
        );
        self.dispatcher.dispatch(&EventEnvelope::now(channel, event));
    }

    pub(crate) fn emit(&self, channel: ChannelKind, event: BridgeEvent) {
        self.dispatcher.dispatch(&EventEnvelope::now(channel, event));
    }

    /// Emit an `error` event and remember the error as the session's last one.
    pub(crate) fn emit_error(&self, channel: ChannelKind, err: &BridgeError) {
        self.remember_error(err);
        self.emit(
            channel,
            BridgeEvent::Error(ErrorEvent {
                message: err.message.clone(),
                code: err.engine_code,
                severity: err.severity(),
            }),
        );
    }

    pub(crate) fn remember_error(&self, err: &BridgeError) {
        if let Ok(mut record) = self.record() {
            record.last_error = Some(err.clone());
        }
    }

    /// Arguments for an engine call, with the engine handle filled in.
    pub(crate) fn engine_args(&self, args: Value) -> Value {
        let mut args = match args {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("options".to_owned(), other);
                map
            }
        };
        args.insert("handle".to_owned(), Value::from(self.engine_handle));
        Value::Object(args)
    }

    /// Call the engine without any lane or state bookkeeping.
    pub(crate) async fn call_engine(&self, op: EngineOp, args: Value) -> Result<Value, BridgeError> {
        tracing::trace!(handle = %self.handle, op = %op, "engine call");
        self.engine
            .call(op, self.engine_args(args))
            .await
            .into_result(op)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{engine::EngineResponse, registry::SessionHandle};

    struct NullEngine;

    #[async_trait::async_trait]
    impl SessionEngine for NullEngine {
        async fn call(&self, _op: EngineOp, args: Value) -> EngineResponse {
            EngineResponse::success(args)
        }
    }

    fn shared() -> SessionShared {
        let (commands, _rx) = mpsc::channel(1);
        SessionShared::new(
            SessionHandle::from_u64(0),
            77,
            SessionConfig::default(),
            Arc::new(NullEngine),
            DeviceIdentity::resolve(true, None, None).expect("identity"),
            commands,
        )
    }

    #[test]
    fn injects_engine_handle_into_arguments() {
        let shared = shared();
        assert_eq!(
            shared.engine_args(json!({ "threadId": 4 })),
            json!({ "threadId": 4, "handle": 77 })
        );
        assert_eq!(shared.engine_args(Value::Null), json!({ "handle": 77 }));
    }

    #[tokio::test]
    async fn transitions_publish_state_to_watchers_and_subscribers() {
        let shared = shared();
        let mut watcher = shared.watch_state(ChannelKind::Plain).expect("watch");
        let (_, mut events) = shared
            .dispatcher
            .subscribe_stream(bridge_core::EventFilter::All)
            .expect("subscribe");

        shared
            .transition(ChannelKind::Plain, |record| {
                let event = record.slot(ChannelKind::Plain).machine.begin_connect()?;
                Ok(((), Some(event)))
            })
            .expect("transition");

        watcher.changed().await.expect("watch update");
        assert_eq!(*watcher.borrow(), ChannelState::Connecting);
        let envelope = events.recv().await.expect("state event");
        assert_eq!(envelope.channel, ChannelKind::Plain);
        assert_eq!(
            envelope.event,
            BridgeEvent::StateChanged {
                state: ChannelState::Connecting
            }
        );
        assert_eq!(
            shared.channel_state(ChannelKind::E2ee).expect("state"),
            ChannelState::Disconnected
        );
    }
}
