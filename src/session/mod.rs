use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::SatelliteConfig;
use crate::listener::{ListenerId, ModemStateListener};
use crate::modem::transport::{GatewayConnection, SatelliteTransport};
use crate::modem::SatelliteModemState;
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::session::session_logic::{ListeningTimeouts, SessionEffect, SessionEvent, SessionLogic, SessionState};
use crate::transfer::transfer_state::DatagramTransferState;
use crate::util::timers::{TimerToken, Timers};

pub mod session_logic;

const REBIND_INITIAL_DELAY: Duration = Duration::from_secs(2);
const REBIND_MAX_DELAY: Duration = Duration::from_secs(64);

pub(crate) enum SessionMessage {
    Event(SessionEvent),
    RegisterListener {
        listener: Arc<dyn ModemStateListener>,
        reply: oneshot::Sender<ListenerId>,
    },
    UnregisterListener(ListenerId),
    SetListeningTimeout(Duration),
    CurrentState(oneshot::Sender<SessionState>),
    TimerFired(SessionTimer, TimerToken),
    Shutdown,
}

impl std::fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMessage::Event(event) => write!(f, "Event({:?})", event),
            SessionMessage::RegisterListener { .. } => write!(f, "RegisterListener"),
            SessionMessage::UnregisterListener(id) => write!(f, "UnregisterListener({})", id),
            SessionMessage::SetListeningTimeout(timeout) => write!(f, "SetListeningTimeout({:?})", timeout),
            SessionMessage::CurrentState(_) => write!(f, "CurrentState"),
            SessionMessage::TimerFired(timer, token) => write!(f, "TimerFired({:?}, {:?})", timer, token),
            SessionMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum SessionTimer {
    Listening,
    Rebind,
}

/// Client side of the session actor
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<SessionMessage>) -> SessionHandle {
        SessionHandle { sender }
    }

    pub fn on_event(&self, event: SessionEvent) {
        self.post(SessionMessage::Event(event));
    }

    pub fn on_transfer_state_changed(&self, send: DatagramTransferState, receive: DatagramTransferState) {
        self.on_event(SessionEvent::TransferStateChanged { send, receive });
    }

    /// The listener is called with the current modem state right away, and with every change
    ///  after that.
    pub async fn register_modem_state_listener(&self, listener: Arc<dyn ModemStateListener>) -> SatelliteResult<ListenerId> {
        let (reply, result) = oneshot::channel();
        if self.sender.send(SessionMessage::RegisterListener { listener, reply }).is_err() {
            return Err(SatelliteError::RequestAborted);
        }
        result.await
            .map_err(|_| SatelliteError::RequestAborted)
    }

    pub fn unregister_modem_state_listener(&self, id: ListenerId) {
        self.post(SessionMessage::UnregisterListener(id));
    }

    /// `Duration::ZERO` restores the configured listening timeouts
    pub fn set_listening_timeout(&self, timeout: Duration) {
        self.post(SessionMessage::SetListeningTimeout(timeout));
    }

    /// `None` if the session is shut down
    pub async fn current_state(&self) -> Option<SessionState> {
        let (reply, result) = oneshot::channel();
        self.sender.send(SessionMessage::CurrentState(reply)).ok()?;
        result.await.ok()
    }

    pub fn shutdown(&self) {
        self.post(SessionMessage::Shutdown);
    }

    fn post(&self, msg: SessionMessage) {
        if self.sender.send(msg).is_err() {
            trace!("session is shut down, dropping message");
        }
    }
}

/// Modem requests issued by the session. They are executed one at a time and in order, so
///  e.g. 'listening off' can not overtake the 'listening on' that preceded it.
#[derive(Copy, Clone, Debug)]
enum ModemCommand {
    SetCellularScanning(bool),
    RequestListening {
        enabled: bool,
        timeout: Duration,
    },
}

async fn run_modem_commands(transport: Arc<dyn SatelliteTransport>, mut commands: mpsc::UnboundedReceiver<ModemCommand>) {
    while let Some(command) = commands.recv().await {
        trace!("executing {:?}", command);
        let result = match command {
            ModemCommand::SetCellularScanning(enabled) => transport.enable_cellular_modem_while_satellite_mode_is_on(enabled).await,
            ModemCommand::RequestListening { enabled, timeout } => transport.request_listening_enabled(enabled, timeout).await,
        };
        if let Err(e) = result {
            warn!("modem request {:?} failed: {}", command, e);
        }
    }
}

/// Runs the modem session state machine and executes the effects of its transitions.
pub(crate) struct Session {
    logic: SessionLogic,
    transport: Arc<dyn SatelliteTransport>,
    gateway: Arc<dyn GatewayConnection>,
    modem_commands: mpsc::UnboundedSender<ModemCommand>,
    modem_commands_recv: Option<mpsc::UnboundedReceiver<ModemCommand>>,
    listeners: Vec<(ListenerId, Arc<dyn ModemStateListener>)>,
    modem_state: SatelliteModemState,
    timers: Timers<SessionTimer, SessionMessage>,
    is_bound: bool,
    rebind_delay: Duration,
}

impl Session {
    pub(crate) fn new(
        config: &SatelliteConfig,
        transport: Arc<dyn SatelliteTransport>,
        gateway: Arc<dyn GatewayConnection>,
        mailbox: mpsc::UnboundedSender<SessionMessage>,
    ) -> Session {
        let (modem_commands, modem_commands_recv) = mpsc::unbounded_channel();
        let logic = SessionLogic::new(config.satellite_supported, ListeningTimeouts::from_config(config));
        Session {
            modem_state: logic.state().modem_state(),
            logic,
            transport,
            gateway,
            modem_commands,
            modem_commands_recv: Some(modem_commands_recv),
            listeners: Vec::new(),
            timers: Timers::new(mailbox, SessionMessage::TimerFired),
            is_bound: false,
            rebind_delay: REBIND_INITIAL_DELAY,
        }
    }

    pub(crate) async fn run(self, recv: mpsc::UnboundedReceiver<SessionMessage>) {
        self.do_run(recv)
            .instrument(info_span!("session"))
            .await
    }

    async fn do_run(mut self, mut recv: mpsc::UnboundedReceiver<SessionMessage>) {
        info!("starting in state {:?}", self.logic.state());
        if let Some(commands) = self.modem_commands_recv.take() {
            tokio::spawn(run_modem_commands(self.transport.clone(), commands)
                .instrument(info_span!("modem_commands")));
        }

        let effects = self.logic.start();
        self.apply(effects);

        while let Some(msg) = recv.recv().await {
            trace!("received {:?}", msg);
            match msg {
                SessionMessage::Event(event) => {
                    let effects = self.logic.on_event(event);
                    self.apply(effects);
                }
                SessionMessage::RegisterListener { listener, reply } => {
                    let _ = reply.send(self.register_listener(listener));
                }
                SessionMessage::UnregisterListener(id) => {
                    self.listeners.retain(|(l, _)| *l != id);
                }
                SessionMessage::SetListeningTimeout(timeout) => self.logic.set_listening_timeout(timeout),
                SessionMessage::CurrentState(reply) => {
                    let _ = reply.send(self.logic.state());
                }
                SessionMessage::TimerFired(timer, token) => {
                    if self.timers.fire(timer, token) {
                        self.on_timer(timer);
                    }
                }
                SessionMessage::Shutdown => break,
            }
        }

        self.timers.cancel_all();
        if self.is_bound {
            self.gateway.unbind();
        }
        info!("shut down");
    }

    fn on_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::Listening => {
                let effects = self.logic.on_event(SessionEvent::ListeningTimerExpired);
                self.apply(effects);
            }
            SessionTimer::Rebind => {
                if !self.is_bound && !matches!(self.logic.state(), SessionState::PowerOff | SessionState::Unavailable) {
                    self.bind();
                }
            }
        }
    }

    fn apply(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            debug!("{:?}", effect);
            match effect {
                SessionEffect::Bind => self.bind(),
                SessionEffect::Unbind => self.unbind(),
                SessionEffect::SetCellularScanning(enabled) => self.modem_command(ModemCommand::SetCellularScanning(enabled)),
                SessionEffect::RequestListening { enabled, timeout } => self.modem_command(ModemCommand::RequestListening { enabled, timeout }),
                SessionEffect::StartListeningTimer(timeout) => self.timers.schedule(SessionTimer::Listening, timeout),
                SessionEffect::CancelListeningTimer => {
                    self.timers.cancel(SessionTimer::Listening);
                }
                SessionEffect::Notify(state) => self.notify(state),
            }
        }
    }

    fn modem_command(&self, command: ModemCommand) {
        if self.modem_commands.send(command).is_err() {
            error!("modem command worker is gone");
        }
    }

    fn bind(&mut self) {
        if self.is_bound {
            return;
        }
        match self.gateway.bind() {
            Ok(()) => {
                info!("bound to satellite gateway");
                self.is_bound = true;
                self.rebind_delay = REBIND_INITIAL_DELAY;
                self.timers.cancel(SessionTimer::Rebind);
            }
            Err(e) => {
                warn!("could not bind to satellite gateway, retrying in {:?}: {}", self.rebind_delay, e);
                self.timers.schedule(SessionTimer::Rebind, self.rebind_delay);
                self.rebind_delay = (self.rebind_delay * 2).min(REBIND_MAX_DELAY);
            }
        }
    }

    fn unbind(&mut self) {
        self.timers.cancel(SessionTimer::Rebind);
        self.rebind_delay = REBIND_INITIAL_DELAY;
        if self.is_bound {
            info!("unbinding from satellite gateway");
            self.gateway.unbind();
            self.is_bound = false;
        }
    }

    fn register_listener(&mut self, listener: Arc<dyn ModemStateListener>) -> ListenerId {
        let id = ListenerId::new();
        match listener.on_satellite_modem_state_changed(self.modem_state) {
            Ok(()) => {
                debug!("registered modem state listener {}", id);
                self.listeners.push((id, listener));
            }
            Err(e) => warn!("modem state listener is unreachable, not registering it: {}", e),
        }
        id
    }

    fn notify(&mut self, state: SatelliteModemState) {
        self.modem_state = state;
        self.listeners.retain(|(id, listener)| {
            match listener.on_satellite_modem_state_changed(state) {
                Ok(()) => true,
                Err(e) => {
                    info!("modem state listener {} is unreachable, removing it: {}", id, e);
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use mockall::Sequence;
    use tokio::time;
    use tokio::time::Instant;

    use crate::listener::ChannelModemStateListener;
    use crate::modem::transport::MockGatewayConnection;
    use crate::test_util::transport::{ScriptedTransport, TransportCall};
    use super::*;

    fn spawn_session(config: SatelliteConfig, transport: Arc<ScriptedTransport>, gateway: MockGatewayConnection) -> SessionHandle {
        let (send, recv) = mpsc::unbounded_channel();
        let session = Session::new(&config, transport, Arc::new(gateway), send.clone());
        tokio::spawn(session.run(recv));
        SessionHandle::new(send)
    }

    fn bound_gateway() -> MockGatewayConnection {
        let mut gateway = MockGatewayConnection::new();
        gateway.expect_bind()
            .returning(|| Ok(()));
        gateway.expect_unbind()
            .return_const(());
        gateway
    }

    async fn listen(session: &SessionHandle) -> mpsc::UnboundedReceiver<SatelliteModemState> {
        let (listener, states) = ChannelModemStateListener::new();
        session.register_modem_state_listener(Arc::new(listener)).await.unwrap();
        states
    }

    fn drain(states: &mut mpsc::UnboundedReceiver<SatelliteModemState>) -> Vec<SatelliteModemState> {
        std::iter::from_fn(|| states.try_recv().ok()).collect()
    }

    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport.clone(), bound_gateway());

        let mut states = listen(&session).await;
        assert_eq!(drain(&mut states), vec![SatelliteModemState::Off]);

        let start = Instant::now();
        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_transfer_state_changed(DatagramTransferState::Sending, DatagramTransferState::Idle);
        session.on_transfer_state_changed(DatagramTransferState::SendSuccess, DatagramTransferState::Idle);
        session.on_transfer_state_changed(DatagramTransferState::Idle, DatagramTransferState::Idle);
        settle().await;

        assert_eq!(session.current_state().await, Some(SessionState::Listening));
        assert_eq!(drain(&mut states), vec![
            SatelliteModemState::Idle,
            SatelliteModemState::DatagramTransferring,
            SatelliteModemState::Listening,
        ]);

        assert_eq!(states.recv().await, Some(SatelliteModemState::Idle));
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        settle().await;

        assert_eq!(transport.calls(), vec![
            TransportCall::CellularScanning(true),
            TransportCall::CellularScanning(false),
            TransportCall::ListeningEnabled(true, Duration::from_secs(180)),
            TransportCall::ListeningEnabled(false, Duration::from_secs(30)),
            TransportCall::CellularScanning(true),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_while_listening_cancels_timer() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, bound_gateway());

        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_transfer_state_changed(DatagramTransferState::Idle, DatagramTransferState::Receiving);
        session.on_transfer_state_changed(DatagramTransferState::Idle, DatagramTransferState::Idle);
        settle().await;
        assert_eq!(session.current_state().await, Some(SessionState::Listening));

        time::sleep(Duration::from_secs(20)).await;
        session.on_transfer_state_changed(DatagramTransferState::Sending, DatagramTransferState::Idle);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(session.current_state().await, Some(SessionState::Transferring));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_timeout_override() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, bound_gateway());

        session.set_listening_timeout(Duration::from_secs(5));
        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_transfer_state_changed(DatagramTransferState::Sending, DatagramTransferState::Idle);
        session.on_transfer_state_changed(DatagramTransferState::Idle, DatagramTransferState::Idle);

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(session.current_state().await, Some(SessionState::Listening));
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.current_state().await, Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_and_unbind() {
        let mut gateway = MockGatewayConnection::new();
        let mut seq = Sequence::new();
        gateway.expect_bind()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        gateway.expect_unbind()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, gateway);

        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_event(SessionEvent::EnabledStateChanged(false));
        assert_eq!(session.current_state().await, Some(SessionState::PowerOff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_with_backoff() {
        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let attempts2 = attempts.clone();

        let mut gateway = MockGatewayConnection::new();
        gateway.expect_bind()
            .returning(move || {
                let mut attempts = attempts2.lock().unwrap();
                attempts.push(Instant::now());
                if attempts.len() < 4 {
                    Err(anyhow::anyhow!("gateway not available"))
                }
                else {
                    Ok(())
                }
            });
        gateway.expect_unbind()
            .return_const(());

        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, gateway);

        let start = Instant::now();
        session.on_event(SessionEvent::EnabledStateChanged(true));
        time::sleep(Duration::from_secs(60)).await;

        let offsets = attempts.lock().unwrap().iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 2, 6, 14]);
        assert_eq!(session.current_state().await, Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_without_support() {
        let mut config = SatelliteConfig::new();
        config.satellite_supported = false;
        let mut gateway = MockGatewayConnection::new();
        gateway.expect_bind()
            .never();

        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(config, transport.clone(), gateway);

        let mut states = listen(&session).await;
        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_transfer_state_changed(DatagramTransferState::Sending, DatagramTransferState::Idle);

        assert_eq!(session.current_state().await, Some(SessionState::Unavailable));
        assert_eq!(drain(&mut states), vec![SatelliteModemState::Unavailable]);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_listener_is_pruned() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, bound_gateway());

        let mut alive = listen(&session).await;
        let dead = listen(&session).await;
        drop(dead);

        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.on_event(SessionEvent::EnabledStateChanged(false));
        settle().await;
        assert_eq!(drain(&mut alive), vec![SatelliteModemState::Off, SatelliteModemState::Idle, SatelliteModemState::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_listener() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, bound_gateway());

        let (listener, mut states) = ChannelModemStateListener::new();
        let id = session.register_modem_state_listener(Arc::new(listener)).await.unwrap();
        session.unregister_modem_state_listener(id);
        session.on_event(SessionEvent::EnabledStateChanged(true));
        settle().await;

        assert_eq!(drain(&mut states), vec![SatelliteModemState::Off]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown() {
        let (transport, _script) = ScriptedTransport::new();
        let session = spawn_session(SatelliteConfig::new(), transport, bound_gateway());

        session.on_event(SessionEvent::EnabledStateChanged(true));
        session.shutdown();
        settle().await;

        assert_eq!(session.current_state().await, None);
        let (listener, _) = ChannelModemStateListener::new();
        assert_eq!(session.register_modem_state_listener(Arc::new(listener)).await, Err(SatelliteError::RequestAborted));
    }
}
