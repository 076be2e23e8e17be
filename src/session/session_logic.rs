use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SatelliteConfig;
use crate::modem::SatelliteModemState;
use crate::transfer::transfer_state::DatagramTransferState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Unavailable,
    PowerOff,
    Idle,
    Transferring,
    Listening,
}

impl SessionState {
    pub fn modem_state(&self) -> SatelliteModemState {
        match self {
            SessionState::Unavailable => SatelliteModemState::Unavailable,
            SessionState::PowerOff => SatelliteModemState::Off,
            SessionState::Idle => SatelliteModemState::Idle,
            SessionState::Transferring => SatelliteModemState::DatagramTransferring,
            SessionState::Listening => SatelliteModemState::Listening,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    EnabledStateChanged(bool),
    TransferStateChanged {
        send: DatagramTransferState,
        receive: DatagramTransferState,
    },
    ListeningTimerExpired,
    SupportChanged(bool),
    DemoModeChanged(bool),
}

/// Side effects of a transition, executed by the session actor in order
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEffect {
    Bind,
    Unbind,
    SetCellularScanning(bool),
    RequestListening {
        enabled: bool,
        timeout: Duration,
    },
    StartListeningTimer(Duration),
    CancelListeningTimer,
    Notify(SatelliteModemState),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListeningTimeouts {
    pub from_sending: Duration,
    pub from_receiving: Duration,
    pub demo: Duration,
}

impl ListeningTimeouts {
    pub fn from_config(config: &SatelliteConfig) -> ListeningTimeouts {
        ListeningTimeouts {
            from_sending: config.stay_at_listening_from_sending,
            from_receiving: config.stay_at_listening_from_receiving,
            demo: config.demo_stay_at_listening,
        }
    }
}

fn is_sending(state: DatagramTransferState) -> bool {
    matches!(state, DatagramTransferState::Sending | DatagramTransferState::SendSuccess)
}

fn is_receiving(state: DatagramTransferState) -> bool {
    matches!(state, DatagramTransferState::Receiving | DatagramTransferState::ReceiveSuccess | DatagramTransferState::ReceiveNone)
}

fn starts_transfer(send: DatagramTransferState, receive: DatagramTransferState) -> bool {
    send == DatagramTransferState::Sending || receive == DatagramTransferState::Receiving
}

/// The modem session as a pure state machine: events go in, the effects of the resulting
///  transition come out. No I/O happens here.
pub struct SessionLogic {
    state: SessionState,
    configured_timeouts: ListeningTimeouts,
    timeouts: ListeningTimeouts,
    /// a send started since the last time the session was idle, so listening uses the
    ///  (longer) send timeout
    is_sending_triggered: bool,
    is_demo_mode: bool,
}

impl SessionLogic {
    pub fn new(is_supported: bool, timeouts: ListeningTimeouts) -> SessionLogic {
        SessionLogic {
            state: if is_supported { SessionState::PowerOff } else { SessionState::Unavailable },
            configured_timeouts: timeouts,
            timeouts,
            is_sending_triggered: false,
            is_demo_mode: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn listening_timeouts(&self) -> ListeningTimeouts {
        self.timeouts
    }

    /// entry effects of the initial state
    pub fn start(&mut self) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        self.enter(self.state, &mut effects);
        effects
    }

    /// `Duration::ZERO` restores the configured timeouts; anything else replaces both the send
    ///  and the receive timeout
    pub fn set_listening_timeout(&mut self, timeout: Duration) {
        if timeout.is_zero() {
            self.timeouts = self.configured_timeouts;
        }
        else {
            self.timeouts.from_sending = timeout;
            self.timeouts.from_receiving = timeout;
        }
        debug!("listening timeouts are now {:?}", self.timeouts);
    }

    pub fn on_event(&mut self, event: SessionEvent) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        match event {
            SessionEvent::DemoModeChanged(is_demo_mode) => {
                self.is_demo_mode = is_demo_mode;
            }
            SessionEvent::SupportChanged(is_supported) => {
                match (self.state, is_supported) {
                    (SessionState::Unavailable, true) => self.transition_to(SessionState::PowerOff, &mut effects),
                    (SessionState::Unavailable, false) => {}
                    (_, false) => self.transition_to(SessionState::Unavailable, &mut effects),
                    (_, true) => {}
                }
            }
            SessionEvent::EnabledStateChanged(is_enabled) => {
                match (self.state, is_enabled) {
                    (SessionState::Unavailable, _) => warn!("satellite is not supported, ignoring enabled state {}", is_enabled),
                    (SessionState::PowerOff, true) => self.transition_to(SessionState::Idle, &mut effects),
                    (SessionState::PowerOff, false) => {}
                    (_, false) => self.transition_to(SessionState::PowerOff, &mut effects),
                    (state, true) => warn!("{:?}: unexpected satellite enabled event", state),
                }
            }
            SessionEvent::TransferStateChanged { send, receive } => {
                if send == DatagramTransferState::Sending {
                    self.is_sending_triggered = true;
                }
                self.on_transfer_state_changed(send, receive, &mut effects);
            }
            SessionEvent::ListeningTimerExpired => {
                if self.state == SessionState::Listening {
                    self.transition_to(SessionState::Idle, &mut effects);
                }
                else {
                    debug!("listening timer expired in {:?}, ignoring", self.state);
                }
            }
        }
        effects
    }

    fn on_transfer_state_changed(&mut self, send: DatagramTransferState, receive: DatagramTransferState, effects: &mut Vec<SessionEffect>) {
        match self.state {
            SessionState::Idle | SessionState::Listening => {
                if starts_transfer(send, receive) {
                    self.transition_to(SessionState::Transferring, effects);
                }
            }
            SessionState::Transferring => {
                if is_sending(send) || is_receiving(receive) {
                    // still busy
                }
                else if send.is_failure() || receive.is_failure() {
                    self.transition_to(SessionState::Idle, effects);
                }
                else {
                    self.transition_to(SessionState::Listening, effects);
                }
            }
            SessionState::Unavailable | SessionState::PowerOff => {}
        }
    }

    fn transition_to(&mut self, new_state: SessionState, effects: &mut Vec<SessionEffect>) {
        info!("session state {:?} -> {:?}", self.state, new_state);
        self.exit(self.state, effects);
        self.state = new_state;
        self.enter(new_state, effects);

        if new_state == SessionState::Unavailable {
            effects.push(SessionEffect::Notify(SatelliteModemState::Unavailable));
        }
    }

    fn enter(&mut self, state: SessionState, effects: &mut Vec<SessionEffect>) {
        match state {
            SessionState::Unavailable => {}
            SessionState::PowerOff => {
                self.is_sending_triggered = false;
                effects.push(SessionEffect::Unbind);
            }
            SessionState::Idle => {
                self.is_sending_triggered = false;
                effects.push(SessionEffect::SetCellularScanning(true));
            }
            SessionState::Transferring => {}
            SessionState::Listening => {
                let timeout = self.listening_timeout();
                self.is_sending_triggered = false;
                effects.push(SessionEffect::RequestListening { enabled: true, timeout });
                effects.push(SessionEffect::StartListeningTimer(timeout));
            }
        }

        if state != SessionState::Unavailable {
            effects.push(SessionEffect::Notify(state.modem_state()));
        }
    }

    fn exit(&mut self, state: SessionState, effects: &mut Vec<SessionEffect>) {
        match state {
            SessionState::PowerOff => effects.push(SessionEffect::Bind),
            SessionState::Idle => effects.push(SessionEffect::SetCellularScanning(false)),
            SessionState::Listening => {
                effects.push(SessionEffect::CancelListeningTimer);
                effects.push(SessionEffect::RequestListening { enabled: false, timeout: self.listening_timeout() });
            }
            SessionState::Unavailable | SessionState::Transferring => {}
        }
    }

    fn listening_timeout(&self) -> Duration {
        if self.is_demo_mode {
            self.timeouts.demo
        }
        else if self.is_sending_triggered {
            self.timeouts.from_sending
        }
        else {
            self.timeouts.from_receiving
        }
    }
}
