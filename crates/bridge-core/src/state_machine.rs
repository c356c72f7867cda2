use crate::{
    error::BridgeError,
    event::BridgeEvent,
    types::{ChannelKind, ChannelState},
};

/// Lifecycle of one channel of one session.
///
/// Every successful transition yields the `stateChanged` event describing it.
#[derive(Debug, Clone)]
pub struct ChannelStateMachine {
    channel: ChannelKind,
    state: ChannelState,
    reconnecting: bool,
    /// Set by a permanent error; cleared by the next explicit connect.
    reconnect_suppressed: bool,
    epoch: u64,
}

impl ChannelStateMachine {
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            state: ChannelState::Disconnected,
            reconnecting: false,
            reconnect_suppressed: false,
            epoch: 0,
        }
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bumped whenever the channel enters or leaves `Connected`.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True while an automatic reconnect sequence owns the channel.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    /// Commands are admitted while connected or while a reconnect may still
    /// bring the channel back.
    pub fn admits_commands(&self) -> bool {
        self.state == ChannelState::Connected || self.reconnecting
    }

    /// Explicit connect: `Disconnected | Failed -> Connecting`.
    pub fn begin_connect(&mut self) -> Result<BridgeEvent, BridgeError> {
        self.transition_from_any_of(
            &[ChannelState::Disconnected, ChannelState::Failed],
            ChannelState::Connecting,
            "connect",
        )?;
        self.reconnect_suppressed = false;
        Ok(self.changed())
    }

    pub fn on_connect_succeeded(&mut self) -> Result<BridgeEvent, BridgeError> {
        self.transition_from_state(
            ChannelState::Connecting,
            ChannelState::Connected,
            "on_connect_succeeded",
        )?;
        self.reconnecting = false;
        self.epoch += 1;
        Ok(self.changed())
    }

    /// Connect attempt failed: permanent failures park the channel in
    /// `Failed`, transient ones return it to `Disconnected`.
    pub fn on_connect_failed(&mut self, permanent: bool) -> Result<BridgeEvent, BridgeError> {
        let next = if permanent {
            ChannelState::Failed
        } else {
            ChannelState::Disconnected
        };
        self.transition_from_state(ChannelState::Connecting, next, "on_connect_failed")?;
        self.reconnecting = false;
        if permanent {
            self.reconnect_suppressed = true;
        }
        Ok(self.changed())
    }

    /// Explicit disconnect. `Ok(None)` when there is nothing to tear down.
    pub fn begin_disconnect(&mut self) -> Result<Option<BridgeEvent>, BridgeError> {
        match self.state {
            ChannelState::Disconnected => Ok(None),
            ChannelState::Disconnecting => Err(BridgeError::invalid_state(
                self.channel,
                self.state,
                "disconnect",
            )),
            ChannelState::Connected | ChannelState::Connecting | ChannelState::Failed => {
                if self.state == ChannelState::Connected {
                    self.epoch += 1;
                }
                self.state = ChannelState::Disconnecting;
                self.reconnecting = false;
                Ok(Some(self.changed()))
            }
        }
    }

    pub fn on_disconnected(&mut self) -> Result<BridgeEvent, BridgeError> {
        self.transition_from_state(
            ChannelState::Disconnecting,
            ChannelState::Disconnected,
            "on_disconnected",
        )?;
        Ok(self.changed())
    }

    /// The engine severed a connected channel. With `reconnect` the channel
    /// re-enters `Connecting` owned by a reconnect sequence; otherwise it goes
    /// to `Disconnected`. `None` when the channel was not connected.
    pub fn on_severed(&mut self, reconnect: bool) -> Option<BridgeEvent> {
        if self.state != ChannelState::Connected {
            return None;
        }
        self.epoch += 1;
        if reconnect && !self.reconnect_suppressed {
            self.state = ChannelState::Connecting;
            self.reconnecting = true;
        } else {
            self.state = ChannelState::Disconnected;
        }
        Some(self.changed())
    }

    /// Permanent failure observed on the channel.
    pub fn on_fatal(&mut self) -> Option<BridgeEvent> {
        self.reconnect_suppressed = true;
        self.reconnecting = false;
        if self.state == ChannelState::Failed {
            return None;
        }
        if self.state == ChannelState::Connected {
            self.epoch += 1;
        }
        self.state = ChannelState::Failed;
        Some(self.changed())
    }

    /// Reconnect budget exhausted.
    pub fn give_up(&mut self) -> Result<BridgeEvent, BridgeError> {
        if !self.reconnecting {
            return Err(BridgeError::invalid_state(self.channel, self.state, "give_up"));
        }
        self.transition_from_state(ChannelState::Connecting, ChannelState::Failed, "give_up")?;
        self.reconnecting = false;
        Ok(self.changed())
    }

    /// Force `Disconnected` (session destroy). `None` when already there.
    pub fn reset(&mut self) -> Option<BridgeEvent> {
        self.reconnecting = false;
        if self.state == ChannelState::Disconnected {
            return None;
        }
        if self.state == ChannelState::Connected {
            self.epoch += 1;
        }
        self.state = ChannelState::Disconnected;
        Some(self.changed())
    }

    fn changed(&self) -> BridgeEvent {
        BridgeEvent::StateChanged { state: self.state }
    }

    fn transition_from_state(
        &mut self,
        expected: ChannelState,
        next: ChannelState,
        action: &str,
    ) -> Result<(), BridgeError> {
        if self.state != expected {
            return Err(BridgeError::invalid_state(self.channel, self.state, action));
        }
        self.state = next;
        Ok(())
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ChannelState],
        next: ChannelState,
        action: &str,
    ) -> Result<(), BridgeError> {
        if !expected.contains(&self.state) {
            return Err(BridgeError::invalid_state(self.channel, self.state, action));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeErrorKind;

    fn connected(channel: ChannelKind) -> ChannelStateMachine {
        let mut sm = ChannelStateMachine::new(channel);
        sm.begin_connect().expect("connect should start");
        sm.on_connect_succeeded().expect("connect should finish");
        sm
    }

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = ChannelStateMachine::new(ChannelKind::Plain);
        assert_eq!(sm.state(), ChannelState::Disconnected);
        assert!(!sm.admits_commands());

        let event = sm.begin_connect().expect("connect should start");
        assert_eq!(
            event,
            BridgeEvent::StateChanged {
                state: ChannelState::Connecting
            }
        );

        sm.on_connect_succeeded().expect("connect should finish");
        assert_eq!(sm.state(), ChannelState::Connected);
        assert_eq!(sm.epoch(), 1);
        assert!(sm.admits_commands());

        sm.begin_disconnect()
            .expect("disconnect should start")
            .expect("connected channel emits a transition");
        assert_eq!(sm.state(), ChannelState::Disconnecting);
        assert!(!sm.admits_commands());

        sm.on_disconnected().expect("disconnect should finish");
        assert_eq!(sm.state(), ChannelState::Disconnected);
        assert_eq!(sm.epoch(), 2);
    }

    #[test]
    fn rejects_connect_while_connected() {
        let mut sm = connected(ChannelKind::E2ee);
        let err = sm.begin_connect().expect_err("double connect must fail");
        assert_eq!(err.kind, BridgeErrorKind::InvalidState);
    }

    #[test]
    fn disconnect_when_disconnected_is_a_no_op() {
        let mut sm = ChannelStateMachine::new(ChannelKind::Plain);
        assert_eq!(sm.begin_disconnect().expect("no-op disconnect"), None);
    }

    #[test]
    fn transient_connect_failure_returns_to_disconnected() {
        let mut sm = ChannelStateMachine::new(ChannelKind::Plain);
        sm.begin_connect().expect("connect should start");
        sm.on_connect_failed(false).expect("failure should apply");
        assert_eq!(sm.state(), ChannelState::Disconnected);
        assert!(!sm.reconnect_suppressed);
    }

    #[test]
    fn permanent_connect_failure_parks_channel_in_failed() {
        let mut sm = ChannelStateMachine::new(ChannelKind::Plain);
        sm.begin_connect().expect("connect should start");
        sm.on_connect_failed(true).expect("failure should apply");
        assert_eq!(sm.state(), ChannelState::Failed);
        assert!(sm.reconnect_suppressed);

        sm.begin_connect().expect("explicit connect from Failed is allowed");
        assert!(!sm.reconnect_suppressed);
    }

    #[test]
    fn severance_with_reconnect_keeps_admitting_commands() {
        let mut sm = connected(ChannelKind::Plain);
        sm.on_severed(true).expect("connected channel can be severed");
        assert_eq!(sm.state(), ChannelState::Connecting);
        assert!(sm.is_reconnecting());
        assert!(sm.admits_commands());

        sm.on_connect_succeeded().expect("reconnect should finish");
        assert!(!sm.is_reconnecting());
        assert_eq!(sm.epoch(), 3);
    }

    #[test]
    fn severance_without_reconnect_disconnects() {
        let mut sm = connected(ChannelKind::Plain);
        sm.on_severed(false).expect("connected channel can be severed");
        assert_eq!(sm.state(), ChannelState::Disconnected);
        assert_eq!(sm.on_severed(true), None);
    }

    #[test]
    fn fatal_error_suppresses_reconnect() {
        let mut sm = connected(ChannelKind::E2ee);
        sm.on_fatal().expect("first fatal transitions");
        assert_eq!(sm.state(), ChannelState::Failed);
        assert_eq!(sm.on_fatal(), None);
        assert!(sm.reconnect_suppressed);
    }

    #[test]
    fn exhausted_reconnect_gives_up_into_failed() {
        let mut sm = connected(ChannelKind::Plain);
        sm.on_severed(true).expect("severed");
        sm.give_up().expect("give up should apply");
        assert_eq!(sm.state(), ChannelState::Failed);
        assert!(!sm.admits_commands());

        let mut idle = ChannelStateMachine::new(ChannelKind::Plain);
        assert!(idle.give_up().is_err());
    }

    #[test]
    fn reset_forces_disconnected() {
        let mut sm = connected(ChannelKind::Plain);
        sm.on_severed(true).expect("severed");
        sm.reset().expect("reset transitions");
        assert_eq!(sm.state(), ChannelState::Disconnected);
        assert!(!sm.is_reconnecting());
        assert_eq!(sm.reset(), None);
    }
}
