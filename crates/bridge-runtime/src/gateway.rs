//! Per-session command worker: one command at a time, in submission order.

use std::sync::Arc;

use bridge_core::{BridgeError, BridgeErrorKind, ChannelKind, ChannelState};
use serde_json::Value;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard, mpsc, oneshot};
use uuid::Uuid;

use crate::{engine::EngineOp, record::SessionShared};

/// A caller command waiting for its turn.
pub(crate) struct PendingCommand {
    pub(crate) id: Uuid,
    pub(crate) scope: Option<ChannelKind>,
    pub(crate) op: EngineOp,
    pub(crate) args: Value,
    pub(crate) reply: oneshot::Sender<Result<Value, BridgeError>>,
}

/// Lane guard held for the duration of one engine call; only its drop matters.
#[allow(dead_code)]
enum LaneGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// Check preconditions, queue the command and wait for its outcome.
///
/// Admission never contacts the engine: a destroyed handle fails with
/// `UnknownHandle`, a channel that is neither connected nor reconnecting with
/// `ChannelNotConnected`.
pub(crate) async fn invoke(
    shared: &SessionShared,
    op: EngineOp,
    args: Value,
) -> Result<Value, BridgeError> {
    let scope = op.channel();
    admit(shared, scope)?;

    let (reply, outcome) = oneshot::channel();
    let command = PendingCommand {
        id: Uuid::new_v4(),
        scope,
        op,
        args,
        reply,
    };
    tracing::trace!(handle = %shared.handle, op = %op, id = %command.id, "queueing command");

    tokio::select! {
        sent = shared.commands.send(command) => {
            if sent.is_err() {
                return Err(lost(scope));
            }
        }
        _ = shared.shutdown.cancelled() => return Err(lost(scope)),
    }

    outcome.await.unwrap_or_else(|_| Err(lost(scope)))
}

fn admit(shared: &SessionShared, scope: Option<ChannelKind>) -> Result<(), BridgeError> {
    let record = shared.record()?;
    if record.destroyed {
        return Err(BridgeError::unknown_handle(shared.handle));
    }
    if let Some(channel) = scope {
        let machine = &record.slot_ref(channel).machine;
        if !machine.admits_commands() {
            return Err(BridgeError::channel_not_connected(channel, machine.state()));
        }
    }
    Ok(())
}

fn lost(scope: Option<ChannelKind>) -> BridgeError {
    match scope {
        Some(channel) => BridgeError::connection_lost(channel),
        None => BridgeError::new(BridgeErrorKind::ConnectionLost, "session shut down"),
    }
}

/// Spawn the command worker of one session.
pub(crate) fn spawn_worker(shared: Arc<SessionShared>, mut commands: mpsc::Receiver<PendingCommand>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                next = commands.recv() => match next {
                    Some(command) => execute(&shared, command).await,
                    None => break,
                },
            }
        }

        commands.close();
        let mut drained = 0_usize;
        while let Ok(command) = commands.try_recv() {
            drained += 1;
            let _ = command.reply.send(Err(lost(command.scope)));
        }
        tracing::debug!(handle = %shared.handle, drained, "command worker stopped");
    });
}

async fn execute(shared: &SessionShared, command: PendingCommand) {
    let PendingCommand {
        id,
        scope,
        op,
        args,
        reply,
    } = command;

    let result = dispatch(shared, scope, op, args).await;
    if let Err(err) = &result {
        tracing::debug!(handle = %shared.handle, op = %op, %id, error = %err, "command failed");
        shared.remember_error(err);
    }
    let _ = reply.send(result);
}

async fn dispatch(
    shared: &SessionShared,
    scope: Option<ChannelKind>,
    op: EngineOp,
    args: Value,
) -> Result<Value, BridgeError> {
    let Some(channel) = scope else {
        let _lane = take_lane(shared, op).await;
        shared.ensure_live()?;
        return shared.call_engine(op, args).await;
    };

    loop {
        wait_until_connected(shared, channel).await?;

        let lane = take_lane(shared, op).await;
        // The channel may have been severed while the lane was contended.
        let epoch = {
            let record = shared.record()?;
            if record.destroyed {
                return Err(BridgeError::connection_lost(channel));
            }
            let machine = &record.slot_ref(channel).machine;
            (machine.state() == ChannelState::Connected).then_some(machine.epoch())
        };
        let Some(epoch) = epoch else {
            drop(lane);
            continue;
        };

        let result = shared.call_engine(op, args).await;
        drop(lane);

        return match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let severed = {
                    let record = shared.record()?;
                    record.destroyed || record.slot_ref(channel).machine.epoch() != epoch
                };
                if severed {
                    tracing::debug!(op = %op, error = %err, "command failed after severance");
                    Err(BridgeError::connection_lost(channel))
                } else {
                    Err(err)
                }
            }
        };
    }
}

async fn take_lane(shared: &SessionShared, op: EngineOp) -> LaneGuard<'_> {
    if op.is_mutating() {
        LaneGuard::Exclusive(shared.lane.write().await)
    } else {
        LaneGuard::Shared(shared.lane.read().await)
    }
}

/// Wait until `channel` is connected. A reconnect in progress is waited out;
/// any other state means the connection is gone.
async fn wait_until_connected(shared: &SessionShared, channel: ChannelKind) -> Result<(), BridgeError> {
    let mut states = shared.watch_state(channel)?;
    loop {
        {
            let record = shared.record()?;
            if record.destroyed {
                return Err(BridgeError::connection_lost(channel));
            }
            let machine = &record.slot_ref(channel).machine;
            if machine.state() == ChannelState::Connected {
                return Ok(());
            }
            if !machine.is_reconnecting() {
                return Err(BridgeError::connection_lost(channel));
            }
        }

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Err(BridgeError::connection_lost(channel));
                }
            }
            _ = shared.shutdown.cancelled() => return Err(BridgeError::connection_lost(channel)),
        }
    }
}
