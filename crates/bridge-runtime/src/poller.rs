//! Per-channel event poller.
//!
//! One poller runs per connected channel. It holds the engine lane shared
//! while a `pollEvents` call is in flight, so commands that need the lane
//! exclusively wait for at most one poll timeout. A call that is already in
//! flight is never abandoned: its batch is delivered even if the poller was
//! cancelled meanwhile.

use std::sync::Arc;

use bridge_core::{
    BridgeError, BridgeEvent, ChannelKind, EventEnvelope, decode_batch, now_ms, parse_batch,
};
use bridge_platform::DeviceChange;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{engine::EngineOp, lifecycle, record::SessionShared};

/// What a delivered batch means for the channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchOutcome {
    severed: bool,
    fatal: bool,
}

pub(crate) fn spawn(
    shared: Arc<SessionShared>,
    channel: ChannelKind,
    epoch: u64,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        tracing::debug!(handle = %shared.handle, channel = %channel, epoch, "poller started");
        run(&shared, channel, epoch, &token).await;
        tracing::debug!(handle = %shared.handle, channel = %channel, epoch, "poller stopped");
    });
}

async fn run(shared: &Arc<SessionShared>, channel: ChannelKind, epoch: u64, token: &CancellationToken) {
    let policy = shared.config.reconnect_policy;
    let mut attempt: u32 = 0;
    let args = json!({
        "channel": channel.as_str(),
        "timeoutMs": shared.config.poll_timeout_ms,
    });

    loop {
        let polled = {
            let _lane = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                lane = shared.lane.read() => lane,
            };
            if !is_current(shared, channel, epoch) {
                return;
            }
            shared.call_engine(EngineOp::PollEvents, args.clone()).await
        };

        match polled.and_then(parse_batch) {
            Ok(batch) => {
                attempt = 0;
                let empty = batch.events.is_empty() && batch.dropped == 0;
                let envelopes = decode_batch(channel, batch, now_ms());
                let outcome = deliver(shared, channel, envelopes);

                if outcome.fatal {
                    lifecycle::on_fatal(shared, channel, epoch, !outcome.severed);
                    return;
                }
                if outcome.severed {
                    lifecycle::on_severed(shared, channel, epoch);
                    return;
                }
                if empty {
                    tokio::task::yield_now().await;
                }
            }
            Err(err) if err.is_permanent() => {
                tracing::warn!(handle = %shared.handle, channel = %channel, error = %err, "poll failed permanently");
                shared.emit_error(channel, &err);
                lifecycle::on_fatal(shared, channel, epoch, true);
                return;
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(
                    handle = %shared.handle,
                    channel = %channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "poll failed, backing off"
                );
                shared.emit_error(channel, &err);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn is_current(shared: &SessionShared, channel: ChannelKind, epoch: u64) -> bool {
    shared
        .record()
        .map(|record| !record.destroyed && record.slot_ref(channel).machine.epoch() == epoch)
        .unwrap_or(false)
}

/// Dispatch one decoded batch in engine order.
fn deliver(shared: &SessionShared, channel: ChannelKind, envelopes: Vec<EventEnvelope>) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for envelope in envelopes {
        match &envelope.event {
            BridgeEvent::DeviceDataChanged { device_data } => {
                match shared.identity.on_change(device_data.clone()) {
                    Ok(DeviceChange::Emit(_)) => {}
                    Ok(DeviceChange::Suppressed) => continue,
                    Err(err) => {
                        tracing::warn!(handle = %shared.handle, error = %err, "failed to persist device identity");
                        shared.emit_error(channel, &BridgeError::storage(err.to_string()));
                        continue;
                    }
                }
            }
            BridgeEvent::Error(error) if error.is_permanent() => {
                shared.remember_error(
                    &BridgeError::from_engine(error.message.clone(), error.code, Some(true)),
                );
                outcome.fatal = true;
            }
            BridgeEvent::Disconnected => outcome.severed = true,
            _ => {}
        }
        shared.dispatcher.dispatch(&envelope);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use bridge_core::{ErrorEvent, ErrorSeverity, EventFilter, SessionConfig};
    use bridge_platform::DeviceIdentity;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        engine::{EngineResponse, SessionEngine},
        registry::SessionHandle,
    };

    struct NullEngine;

    #[async_trait::async_trait]
    impl SessionEngine for NullEngine {
        async fn call(&self, _op: EngineOp, _args: Value) -> EngineResponse {
            EngineResponse::success(Value::Null)
        }
    }

    fn shared(identity: DeviceIdentity) -> SessionShared {
        let (commands, _rx) = mpsc::channel(1);
        SessionShared::new(
            SessionHandle::from_u64(0),
            1,
            SessionConfig::default(),
            Arc::new(NullEngine),
            identity,
            commands,
        )
    }

    fn envelope(event: BridgeEvent) -> EventEnvelope {
        EventEnvelope::new(ChannelKind::E2ee, 1, event)
    }

    #[tokio::test]
    async fn memory_only_identity_changes_are_not_dispatched() {
        let shared = shared(DeviceIdentity::resolve(true, None, None).expect("identity"));
        let (_, mut events) = shared
            .dispatcher
            .subscribe_stream(EventFilter::All)
            .expect("subscribe");

        let outcome = deliver(
            &shared,
            ChannelKind::E2ee,
            vec![
                envelope(BridgeEvent::DeviceDataChanged {
                    device_data: "blob".to_owned(),
                }),
                envelope(BridgeEvent::E2eeConnected),
            ],
        );

        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(
            shared.identity.current().expect("current").as_deref(),
            Some("blob")
        );
        let first = events.recv().await.expect("event");
        assert_eq!(first.event, BridgeEvent::E2eeConnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn permanent_errors_and_disconnects_are_dispatched_and_reported() {
        let shared = shared(DeviceIdentity::resolve(false, Some("seed".to_owned()), None).expect("identity"));
        let (_, mut events) = shared
            .dispatcher
            .subscribe_stream(EventFilter::All)
            .expect("subscribe");

        let fatal = ErrorEvent {
            message: "session invalid".to_owned(),
            code: Some(1),
            severity: ErrorSeverity::Permanent,
        };
        let outcome = deliver(
            &shared,
            ChannelKind::Plain,
            vec![
                envelope(BridgeEvent::Error(fatal.clone())),
                envelope(BridgeEvent::Disconnected),
            ],
        );

        assert_eq!(
            outcome,
            BatchOutcome {
                severed: true,
                fatal: true
            }
        );
        assert_eq!(
            events.recv().await.expect("error").event,
            BridgeEvent::Error(fatal)
        );
        assert_eq!(
            events.recv().await.expect("disconnect").event,
            BridgeEvent::Disconnected
        );
        let remembered = shared
            .record()
            .expect("record")
            .last_error
            .clone()
            .expect("last error");
        assert!(remembered.is_permanent());
    }
}
