//! Connection lifecycle of the two channels of a session.
//!
//! Every path that changes a channel's state goes through
//! `SessionShared::transition`, so `stateChanged` events and state watchers
//! observe transitions in the order they happen. Engine calls that change
//! connection state take the engine lane exclusively.

use std::sync::Arc;

use bridge_core::{
    BridgeError, BridgeErrorKind, BridgeEvent, ChannelKind, ChannelState, ErrorEvent,
    ErrorSeverity, InitialSync, PlainSync, decode_payload,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{engine::EngineOp, poller, record::SessionShared};

/// Explicit connect of one channel.
///
/// The initial sync is returned to the caller and remembered on the record; it
/// is never dispatched as an event.
pub(crate) async fn connect(
    shared: &Arc<SessionShared>,
    channel: ChannelKind,
) -> Result<InitialSync, BridgeError> {
    if channel == ChannelKind::E2ee && !shared.config.enable_e2ee {
        return Err(BridgeError::channel_disabled(channel));
    }

    shared.transition(channel, |record| {
        if record.destroyed {
            return Err(BridgeError::unknown_handle(shared.handle));
        }
        let event = record.slot(channel).machine.begin_connect()?;
        Ok(((), Some(event)))
    })?;
    tracing::info!(handle = %shared.handle, channel = %channel, "connecting");

    let outcome = match attempt_connect(shared, channel, None).await {
        Ok(sync) => finish_connect(shared, channel, sync.clone(), None).map(|()| sync),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(sync) => {
            tracing::info!(handle = %shared.handle, channel = %channel, "connected");
            Ok(sync)
        }
        Err(err) => {
            tracing::warn!(handle = %shared.handle, channel = %channel, error = %err, "connect failed");
            shared.remember_error(&err);
            let permanent = err.is_permanent();
            let _ = shared.transition(channel, |record| {
                let machine = &mut record.slot(channel).machine;
                // Only roll back our own attempt; disconnect or destroy may
                // have taken the channel over meanwhile.
                if machine.state() != ChannelState::Connecting || machine.is_reconnecting() {
                    return Ok(((), None));
                }
                let event = machine.on_connect_failed(permanent)?;
                Ok(((), Some(event)))
            });
            Err(err)
        }
    }
}

/// One engine connect under the exclusive lane.
///
/// A reconnect passes its token; once cancelled, no engine connect is made
/// even if the lane was only just obtained.
async fn attempt_connect(
    shared: &SessionShared,
    channel: ChannelKind,
    reconnect: Option<&CancellationToken>,
) -> Result<InitialSync, BridgeError> {
    let _lane = shared.lane.write().await;
    shared.ensure_live()?;
    if reconnect.is_some_and(CancellationToken::is_cancelled) {
        return Err(BridgeError::connection_lost(channel));
    }

    match channel {
        ChannelKind::Plain => {
            let data = shared.call_engine(EngineOp::Connect, json!({})).await?;
            let sync: PlainSync = decode_payload(EngineOp::Connect.as_str(), data)?;
            Ok(InitialSync::Plain(sync))
        }
        ChannelKind::E2ee => {
            let device = shared.identity.current().map_err(storage_error)?;
            let args = match device {
                Some(device_data) => json!({ "deviceData": device_data }),
                None => json!({}),
            };
            let data = shared.call_engine(EngineOp::ConnectE2ee, args).await?;
            Ok(InitialSync::E2ee(data))
        }
    }
}

/// Move a connecting channel to `Connected` and start its poller.
///
/// `reconnect` is the token of the reconnect sequence that made the attempt;
/// if it was cancelled meanwhile the result is discarded.
fn finish_connect(
    shared: &Arc<SessionShared>,
    channel: ChannelKind,
    sync: InitialSync,
    reconnect: Option<&CancellationToken>,
) -> Result<(), BridgeError> {
    let started = shared.transition(channel, |record| {
        if record.destroyed || reconnect.is_some_and(CancellationToken::is_cancelled) {
            return Err(BridgeError::connection_lost(channel));
        }
        let slot = record.slot(channel);
        let event = slot
            .machine
            .on_connect_succeeded()
            .map_err(|_| BridgeError::connection_lost(channel))?;
        slot.reconnect = None;
        slot.initial_sync = Some(sync);
        let token = shared.shutdown.child_token();
        slot.poller = Some(token.clone());
        Ok(((slot.machine.epoch(), token), Some(event)))
    })?;

    let (epoch, token) = started;
    poller::spawn(Arc::clone(shared), channel, epoch, token);
    Ok(())
}

/// Explicit disconnect. Idempotent when the channel is already disconnected.
pub(crate) async fn disconnect(
    shared: &SessionShared,
    channel: ChannelKind,
) -> Result<(), BridgeError> {
    let started = shared.transition(channel, |record| {
        if record.destroyed {
            return Err(BridgeError::unknown_handle(shared.handle));
        }
        let slot = record.slot(channel);
        let event = slot.machine.begin_disconnect()?;
        if event.is_some() {
            slot.stop_tasks();
        }
        Ok((event.is_some(), event))
    })?;
    if !started {
        return Ok(());
    }

    let result = {
        let _lane = shared.lane.write().await;
        shared
            .call_engine(EngineOp::Disconnect, json!({ "channel": channel.as_str() }))
            .await
    };

    if channel == ChannelKind::E2ee {
        if let Err(err) = shared.identity.forget() {
            tracing::warn!(handle = %shared.handle, error = %err, "failed to reset device identity");
        }
    }

    let _ = shared.transition(channel, |record| {
        let machine = &mut record.slot(channel).machine;
        if machine.state() != ChannelState::Disconnecting {
            return Ok(((), None));
        }
        let event = machine.on_disconnected()?;
        Ok(((), Some(event)))
    });
    tracing::info!(handle = %shared.handle, channel = %channel, "disconnected");

    result.map(|_| ()).inspect_err(|err| shared.remember_error(err))
}

/// The engine reported that a connected channel went away.
///
/// Stale reports, whose epoch no longer matches, are ignored.
pub(crate) fn on_severed(shared: &Arc<SessionShared>, channel: ChannelKind, epoch: u64) {
    let reconnect = shared.transition(channel, |record| {
        let slot = record.slot(channel);
        if record_is_stale(slot.machine.epoch(), epoch) {
            return Ok((None, None));
        }
        let event = slot.machine.on_severed(shared.config.auto_reconnect);
        slot.stop_tasks();
        let token = slot.machine.is_reconnecting().then(|| {
            let token = shared.shutdown.child_token();
            slot.reconnect = Some(token.clone());
            token
        });
        Ok((token, event))
    });

    match reconnect {
        Ok(Some(token)) => {
            tracing::info!(
                handle = %shared.handle,
                channel = %channel,
                backoff_bound_ms = shared.config.reconnect_policy.total_backoff_bound().as_millis() as u64,
                "channel severed, reconnecting"
            );
            let shared = Arc::clone(shared);
            tokio::spawn(async move { reconnect_loop(shared, channel, token).await });
        }
        Ok(None) => {
            tracing::info!(handle = %shared.handle, channel = %channel, "channel severed");
        }
        Err(err) => {
            tracing::error!(handle = %shared.handle, channel = %channel, error = %err, "failed to record severance");
        }
    }
}

/// Permanent failure on a channel: it goes `Failed` and will not reconnect.
///
/// With `announce_disconnect` a `disconnected` event precedes the state
/// change, for failures the engine did not already report as a severance.
pub(crate) fn on_fatal(
    shared: &SessionShared,
    channel: ChannelKind,
    epoch: u64,
    announce_disconnect: bool,
) {
    let result = shared.transition(channel, |record| {
        let slot = record.slot(channel);
        if record_is_stale(slot.machine.epoch(), epoch) {
            return Ok(((), None));
        }
        slot.stop_tasks();
        let event = slot.machine.on_fatal();
        if event.is_some() && announce_disconnect {
            shared.emit(channel, BridgeEvent::Disconnected);
        }
        Ok(((), event))
    });
    match result {
        Ok(()) => tracing::warn!(handle = %shared.handle, channel = %channel, "channel failed permanently"),
        Err(err) => tracing::error!(handle = %shared.handle, channel = %channel, error = %err, "failed to record fatal error"),
    }
}

fn record_is_stale(current: u64, observed: u64) -> bool {
    current != observed
}

async fn reconnect_loop(shared: Arc<SessionShared>, channel: ChannelKind, token: CancellationToken) {
    let policy = shared.config.reconnect_policy;
    let mut attempt: u32 = 0;

    loop {
        if !policy.allows_attempt(attempt) {
            give_up(&shared, channel, &token, attempt);
            return;
        }

        let delay = policy.delay_for_attempt(attempt);
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
        tracing::info!(handle = %shared.handle, channel = %channel, attempt, "reconnect attempt");

        let result = match attempt_connect(&shared, channel, Some(&token)).await {
            Ok(sync) => finish_connect(&shared, channel, sync, Some(&token)),
            Err(err) => Err(err),
        };
        if token.is_cancelled() {
            return;
        }

        match result {
            Ok(()) => {
                tracing::info!(handle = %shared.handle, channel = %channel, attempt, "reconnected");
                return;
            }
            Err(err) if err.is_permanent() => {
                shared.emit_error(channel, &err);
                let _ = shared.transition(channel, |record| {
                    let slot = record.slot(channel);
                    if token.is_cancelled() {
                        return Ok(((), None));
                    }
                    slot.reconnect = None;
                    Ok(((), slot.machine.on_fatal()))
                });
                tracing::warn!(handle = %shared.handle, channel = %channel, error = %err, "reconnect failed permanently");
                return;
            }
            Err(err) => {
                tracing::warn!(handle = %shared.handle, channel = %channel, attempt, error = %err, "reconnect attempt failed");
                shared.emit_error(channel, &err);
            }
        }
    }
}

fn give_up(shared: &SessionShared, channel: ChannelKind, token: &CancellationToken, attempts: u32) {
    let err = BridgeError::new(
        BridgeErrorKind::ConnectionLost,
        format!("{channel} channel reconnect gave up after {attempts} attempt(s)"),
    );
    let gave_up = shared.transition(channel, |record| {
        let slot = record.slot(channel);
        if token.is_cancelled() {
            return Ok((false, None));
        }
        slot.reconnect = None;
        let event = slot.machine.give_up()?;
        Ok((true, Some(event)))
    });
    if matches!(gave_up, Ok(true)) {
        tracing::warn!(handle = %shared.handle, channel = %channel, attempts, "reconnect gave up");
        shared.remember_error(&err);
        shared.emit(
            channel,
            BridgeEvent::Error(ErrorEvent {
                message: err.message,
                code: None,
                severity: ErrorSeverity::Permanent,
            }),
        );
    }
}

/// Tear a session down. Idempotent.
///
/// Pollers, reconnect loops and the command worker are cancelled, channels
/// move to `Disconnected`, and the engine is disconnected in the background
/// once in-flight calls have released the lane.
pub(crate) fn destroy(shared: &Arc<SessionShared>) -> Result<(), BridgeError> {
    let mut live_channels = Vec::new();
    {
        let mut record = shared.record()?;
        if record.destroyed {
            return Ok(());
        }
        record.destroyed = true;
        for channel in ChannelKind::ALL {
            let slot = record.slot(channel);
            slot.stop_tasks();
            if slot.machine.state() != ChannelState::Disconnected {
                live_channels.push(channel);
            }
            if let Some(event) = slot.machine.reset() {
                shared.publish_locked(&mut *record, channel, event);
            }
        }
    }
    shared.shutdown.cancel();
    shared.dispatcher.close();
    tracing::info!(handle = %shared.handle, "session destroyed");

    if live_channels.is_empty() {
        return Ok(());
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(handle = %shared.handle, "no runtime, skipping engine disconnect");
        return Ok(());
    };
    let shared = Arc::clone(shared);
    runtime.spawn(async move {
        let _lane = shared.lane.write().await;
        for channel in live_channels {
            if let Err(err) = shared
                .call_engine(EngineOp::Disconnect, json!({ "channel": channel.as_str() }))
                .await
            {
                tracing::debug!(handle = %shared.handle, channel = %channel, error = %err, "best-effort disconnect failed");
            }
        }
    });
    Ok(())
}

fn storage_error(err: bridge_platform::DeviceStoreError) -> BridgeError {
    BridgeError::storage(err.to_string())
}
