use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{SatelliteConfig, SubscriptionValidator};
use crate::datagram::datagram_id::DurableIdAllocator;
use crate::datagram::datagram_store::{DatagramStore, DurableCounterStore};
use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::listener::{DatagramListener, ListenerId, ModemStateListener};
use crate::modem::transport::{GatewayConnection, SatelliteTransport};
use crate::modem::SatelliteModemState;
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::session::session_logic::{SessionEvent, SessionState};
use crate::session::{Session, SessionHandle};
use crate::transfer::controller::DatagramController;
use crate::transfer::demo_mode::DemoModeConfig;
use crate::transfer::dispatcher::{Dispatcher, DispatcherHandle};
use crate::transfer::receiver::{Receiver, ReceiverHandle};
use crate::transfer::transfer_events::TransferEvent;

/// Everything the engine talks to outside of itself
pub struct EngineCollaborators {
    pub transport: Arc<dyn SatelliteTransport>,
    pub gateway: Arc<dyn GatewayConnection>,
    pub counter_store: Arc<dyn DurableCounterStore>,
    pub datagram_store: Arc<dyn DatagramStore>,
    pub subscriptions: Arc<dyn SubscriptionValidator>,
}

/// Entry point for applications: sends and receives datagrams over the satellite link, and
///  tracks the modem session.
///
/// Creating the engine spawns its actors on the current tokio runtime. Dropping it shuts them
///  down, aborting everything that is still pending.
pub struct SatelliteEngine {
    config: Arc<SatelliteConfig>,
    demo: Arc<DemoModeConfig>,
    subscriptions: Arc<dyn SubscriptionValidator>,
    is_supported: AtomicBool,
    controller: Arc<DatagramController>,
    dispatcher: DispatcherHandle,
    receiver: ReceiverHandle,
    session: SessionHandle,
}

impl SatelliteEngine {
    pub fn new(config: Arc<SatelliteConfig>, collaborators: EngineCollaborators) -> anyhow::Result<SatelliteEngine> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .context("the satellite engine must be created inside a tokio runtime")?;

        let EngineCollaborators { transport, gateway, counter_store, datagram_store, subscriptions } = collaborators;

        let demo = Arc::new(DemoModeConfig::new(&config));

        let (dispatcher_send, dispatcher_recv) = mpsc::unbounded_channel();
        let (receiver_send, receiver_recv) = mpsc::unbounded_channel();
        let (session_send, session_recv) = mpsc::unbounded_channel();

        let dispatcher = DispatcherHandle::new(dispatcher_send.clone());
        let receiver = ReceiverHandle::new(receiver_send.clone());
        let session = SessionHandle::new(session_send.clone());

        let controller = Arc::new(DatagramController::new(session.clone(), dispatcher.clone()));

        let session_actor = Session::new(&config, transport.clone(), gateway, session_send);
        let dispatcher_actor = Dispatcher::new(config.clone(), demo.clone(), controller.clone(), transport.clone(), receiver.clone(), dispatcher_send);
        let receiver_actor = Receiver::new(config.clone(), demo.clone(), controller.clone(), transport, datagram_store, subscriptions.clone(), DurableIdAllocator::new(counter_store), receiver_send);

        tokio::spawn(session_actor.run(session_recv));
        tokio::spawn(dispatcher_actor.run(dispatcher_recv));
        tokio::spawn(receiver_actor.run(receiver_recv));

        info!("satellite engine started");
        Ok(SatelliteEngine {
            is_supported: AtomicBool::new(config.satellite_supported),
            config,
            demo,
            subscriptions,
            controller,
            dispatcher,
            receiver,
            session,
        })
    }

    pub fn is_satellite_supported(&self) -> bool {
        self.is_supported.load(Ordering::Acquire)
    }

    /// Resolves once the datagram was sent, or failed. A failure aborts every other datagram
    ///  that is queued at that point with [SatelliteError::RequestAborted].
    pub async fn send_satellite_datagram(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, need_full_screen_ui: bool) -> SatelliteResult {
        let subscription_id = self.subscriptions.validated_subscription_id(subscription_id);
        self.dispatcher.send_datagram(subscription_id, datagram_type, datagram, need_full_screen_ui).await
    }

    /// Asks the modem for pending incoming datagrams, which are then delivered to the
    ///  subscription's datagram listeners. Fails with [SatelliteError::ModemBusy] rather than
    ///  waiting if a transfer is in progress.
    pub async fn poll_pending_satellite_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult {
        let subscription_id = self.subscriptions.validated_subscription_id(subscription_id);
        self.receiver.poll_pending_datagrams(subscription_id).await
    }

    pub async fn register_for_satellite_datagram(&self, subscription_id: SubscriptionId, listener: Arc<dyn DatagramListener>) -> SatelliteResult<ListenerId> {
        if !self.is_satellite_supported() {
            debug!("satellite is not supported, refusing datagram listener");
            return Err(SatelliteError::NotSupported);
        }
        let subscription_id = self.subscriptions.validated_subscription_id(subscription_id);
        self.receiver.register_listener(subscription_id, listener).await
    }

    pub fn unregister_for_satellite_datagram(&self, subscription_id: SubscriptionId, listener: ListenerId) {
        let subscription_id = self.subscriptions.validated_subscription_id(subscription_id);
        self.receiver.unregister_listener(subscription_id, listener);
    }

    /// The listener receives the current modem state right away.
    pub async fn register_for_modem_state_changed(&self, listener: Arc<dyn ModemStateListener>) -> SatelliteResult<ListenerId> {
        if !self.is_satellite_supported() {
            debug!("satellite is not supported, refusing modem state listener");
            return Err(SatelliteError::NotSupported);
        }
        self.session.register_modem_state_listener(listener).await
    }

    pub fn unregister_for_modem_state_changed(&self, listener: ListenerId) {
        self.session.unregister_modem_state_listener(listener);
    }

    pub fn subscribe_transfer_events(&self) -> broadcast::Receiver<TransferEvent> {
        self.controller.subscribe()
    }

    pub fn is_sending_in_idle_state(&self) -> bool {
        self.controller.is_sending_in_idle_state()
    }

    pub fn is_polling_in_idle_state(&self) -> bool {
        self.controller.is_polling_in_idle_state()
    }

    pub fn on_satellite_enabled_state_changed(&self, is_enabled: bool) {
        info!("satellite enabled: {}", is_enabled);
        self.session.on_event(SessionEvent::EnabledStateChanged(is_enabled));
    }

    pub fn on_satellite_support_changed(&self, is_supported: bool) {
        let was_supported = self.is_supported.swap(is_supported, Ordering::AcqRel);
        if was_supported != is_supported {
            info!("satellite supported: {}", is_supported);
        }
        self.session.on_event(SessionEvent::SupportChanged(is_supported));
    }

    pub fn on_radio_power_lost(&self) {
        warn!("radio powered off, disabling satellite");
        self.disable();
    }

    pub fn on_provisioning_lost(&self) {
        warn!("satellite service is no longer provisioned, disabling satellite");
        self.disable();
    }

    fn disable(&self) {
        self.session.on_event(SessionEvent::EnabledStateChanged(false));
        self.on_modem_state_changed(SatelliteModemState::Off);
    }

    /// modem state as pushed by the transport
    pub fn on_modem_state_changed(&self, state: SatelliteModemState) {
        if state.is_off_or_unavailable() && self.demo.is_enabled() {
            info!("modem is {:?}, leaving demo mode", state);
            self.set_demo_mode(false);
        }
        self.dispatcher.on_modem_state_changed(state);
        self.receiver.on_modem_state_changed(state);
    }

    pub fn set_demo_mode(&self, is_enabled: bool) {
        self.demo.set_enabled(is_enabled);
        self.session.on_event(SessionEvent::DemoModeChanged(is_enabled));
        if !is_enabled {
            self.controller.clear_demo_datagram();
            self.set_device_aligned_with_satellite(false);
        }
    }

    pub fn is_demo_mode_enabled(&self) -> bool {
        self.demo.is_enabled()
    }

    pub fn set_device_aligned_with_satellite(&self, is_aligned: bool) {
        self.dispatcher.set_device_aligned(is_aligned);
        self.receiver.set_device_aligned(is_aligned);
    }

    /// demo mode alignment wait; returns `false` unless test overrides are allowed
    pub fn set_alignment_timeout(&self, reset: bool, timeout: Duration) -> bool {
        if !self.allows_test_overrides() {
            return false;
        }
        self.demo.override_align_timeout(reset, timeout);
        true
    }

    /// `Duration::ZERO` restores the configured timeouts; returns `false` unless test
    ///  overrides are allowed
    pub fn set_listening_timeout(&self, timeout: Duration) -> bool {
        if !self.allows_test_overrides() {
            return false;
        }
        self.session.set_listening_timeout(timeout);
        true
    }

    /// returns `false` unless test overrides are allowed
    pub fn set_demo_poll_delay(&self, reset: bool, delay: Duration) -> bool {
        if !self.allows_test_overrides() {
            return false;
        }
        self.demo.override_poll_delay(reset, delay);
        true
    }

    fn allows_test_overrides(&self) -> bool {
        if !self.config.allow_test_overrides {
            warn!("runtime overrides are not allowed");
        }
        self.config.allow_test_overrides
    }

    /// `None` after shutdown
    pub async fn current_session_state(&self) -> Option<SessionState> {
        self.session.current_state().await
    }

    pub fn shutdown(&self) {
        debug!("shutting down");
        self.dispatcher.shutdown();
        self.receiver.shutdown();
        self.session.shutdown();
    }
}

impl Drop for SatelliteEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
