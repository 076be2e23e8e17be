use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::SatelliteConfig;
use crate::datagram::datagram_id::{DatagramId, SendIdAllocator};
use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::modem::transport::SatelliteTransport;
use crate::modem::SatelliteModemState;
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::transfer::controller::DatagramController;
use crate::transfer::demo_mode::{AlignmentGate, DemoModeConfig};
use crate::transfer::dispatcher::send_queue::{PendingSendEntry, SendQueues};
use crate::transfer::receiver::ReceiverHandle;
use crate::transfer::transfer_state::{DatagramTransferState, TransferStatus};
use crate::util::timers::{TimerToken, Timers};

pub mod send_queue;

#[derive(Debug)]
pub(crate) enum DispatcherMessage {
    Send {
        subscription_id: SubscriptionId,
        datagram_type: DatagramType,
        datagram: Datagram,
        need_full_screen_ui: bool,
        reply: oneshot::Sender<SatelliteResult>,
    },
    SendDone {
        id: DatagramId,
        result: SatelliteResult,
    },
    RetrySending,
    ModemStateChanged(SatelliteModemState),
    DeviceAligned(bool),
    TimerFired(DispatcherTimer, TimerToken),
    Shutdown,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum DispatcherTimer {
    SendResponse(DatagramId),
    Alignment,
}

/// Client side of the dispatcher actor
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    sender: mpsc::UnboundedSender<DispatcherMessage>,
}

impl DispatcherHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<DispatcherMessage>) -> DispatcherHandle {
        DispatcherHandle { sender }
    }

    /// Queues a datagram and resolves once it was sent, failed, or was aborted.
    pub async fn send_datagram(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, need_full_screen_ui: bool) -> SatelliteResult {
        let (reply, result) = oneshot::channel();
        if self.sender.send(DispatcherMessage::Send { subscription_id, datagram_type, datagram, need_full_screen_ui, reply }).is_err() {
            warn!("dispatcher is shut down, rejecting datagram");
            return Err(SatelliteError::RequestAborted);
        }
        result.await
            .unwrap_or(Err(SatelliteError::RequestAborted))
    }

    /// start the next queued datagram if the transport is free - called when the receive side
    ///  becomes idle
    pub fn retry_sending_datagrams(&self) {
        self.post(DispatcherMessage::RetrySending);
    }

    pub fn on_modem_state_changed(&self, state: SatelliteModemState) {
        self.post(DispatcherMessage::ModemStateChanged(state));
    }

    pub fn set_device_aligned(&self, is_aligned: bool) {
        self.post(DispatcherMessage::DeviceAligned(is_aligned));
    }

    pub fn shutdown(&self) {
        self.post(DispatcherMessage::Shutdown);
    }

    fn post(&self, msg: DispatcherMessage) {
        if self.sender.send(msg).is_err() {
            trace!("dispatcher is shut down, dropping message");
        }
    }
}

/// Owns the outgoing queues and the one send that may be in flight at the transport.
pub(crate) struct Dispatcher {
    config: Arc<SatelliteConfig>,
    demo: Arc<DemoModeConfig>,
    controller: Arc<DatagramController>,
    transport: Arc<dyn SatelliteTransport>,
    receiver: ReceiverHandle,
    mailbox: mpsc::UnboundedSender<DispatcherMessage>,
    ids: SendIdAllocator,
    queues: SendQueues,
    /// the entry handed to the transport; it stays in its queue until completed
    in_flight: Option<DatagramId>,
    timers: Timers<DispatcherTimer, DispatcherMessage>,
    /// demo mode: successful completion waiting for the device to be aligned
    alignment: AlignmentGate<(), DatagramId>,
    is_aligned: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        config: Arc<SatelliteConfig>,
        demo: Arc<DemoModeConfig>,
        controller: Arc<DatagramController>,
        transport: Arc<dyn SatelliteTransport>,
        receiver: ReceiverHandle,
        mailbox: mpsc::UnboundedSender<DispatcherMessage>,
    ) -> Dispatcher {
        Dispatcher {
            config,
            demo,
            controller,
            transport,
            receiver,
            timers: Timers::new(mailbox.clone(), DispatcherMessage::TimerFired),
            mailbox,
            ids: SendIdAllocator::new(),
            queues: SendQueues::new(),
            in_flight: None,
            alignment: AlignmentGate::new(),
            is_aligned: false,
        }
    }

    pub(crate) async fn run(self, recv: mpsc::UnboundedReceiver<DispatcherMessage>) {
        self.do_run(recv)
            .instrument(info_span!("dispatcher"))
            .await
    }

    async fn do_run(mut self, mut recv: mpsc::UnboundedReceiver<DispatcherMessage>) {
        info!("starting");
        while let Some(msg) = recv.recv().await {
            trace!("received {:?}", msg);
            match msg {
                DispatcherMessage::Send { subscription_id, datagram_type, datagram, need_full_screen_ui, reply } => {
                    self.on_send(subscription_id, datagram_type, datagram, need_full_screen_ui, reply)
                }
                DispatcherMessage::SendDone { id, result } => self.on_send_done(id, result),
                DispatcherMessage::RetrySending => self.send_next(),
                DispatcherMessage::ModemStateChanged(state) => self.on_modem_state_changed(state),
                DispatcherMessage::DeviceAligned(is_aligned) => self.on_device_aligned(is_aligned),
                DispatcherMessage::TimerFired(timer, token) => {
                    if self.timers.fire(timer, token) {
                        self.on_timer(timer);
                    }
                }
                DispatcherMessage::Shutdown => {
                    self.abort_all(SatelliteError::RequestAborted);
                    break;
                }
            }
        }
        self.timers.cancel_all();
        info!("shut down");
    }

    fn on_send(&mut self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, need_full_screen_ui: bool, reply: oneshot::Sender<SatelliteResult>) {
        let id = self.ids.allocate();
        debug!("queueing datagram {} ({:?}, subscription {})", id, datagram_type, subscription_id);

        if self.demo.is_enabled() && datagram_type.is_emergency() {
            self.controller.capture_demo_datagram(datagram.clone());
        }

        self.queues.push(PendingSendEntry {
            id,
            subscription_id,
            datagram_type,
            datagram,
            need_full_screen_ui,
            enqueued_at: Instant::now(),
            reply,
        });

        self.send_next();
    }

    /// hands the next eligible entry to the transport, unless a send is in flight or the
    ///  receive side is busy
    fn send_next(&mut self) {
        if let Some(id) = self.in_flight {
            trace!("datagram {} is in flight, not sending the next one yet", id);
            return;
        }

        let Some(next) = self.queues.next_eligible() else {
            return;
        };
        let id = next.id;
        let subscription_id = next.subscription_id;
        let datagram_type = next.datagram_type;
        let datagram = next.datagram.clone();
        let need_full_screen_ui = next.need_full_screen_ui;

        if !self.transport.is_available() {
            error!("no satellite transport, cannot send datagram {}", id);
            self.fail_and_abort(id, SatelliteError::InvalidTelephonyState);
            return;
        }

        if !self.controller.try_start_sending(subscription_id, datagram_type, self.queues.len() as i32) {
            debug!("receiving datagrams, datagram {} stays queued", id);
            return;
        }

        debug!("sending datagram {} ({:?}, {} bytes)", id, datagram_type, datagram.len());
        self.in_flight = Some(id);
        self.timers.schedule(DispatcherTimer::SendResponse(id), self.config.send_response_timeout);

        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = transport.send_datagram(subscription_id, datagram_type, datagram, need_full_screen_ui).await;
            let _ = mailbox.send(DispatcherMessage::SendDone { id, result });
        });
    }

    fn on_send_done(&mut self, id: DatagramId, result: SatelliteResult) {
        if self.in_flight != Some(id) || !self.queues.contains(id) {
            // timed out or aborted in the meantime
            warn!("ignoring completion {:?} for datagram {} which is no longer pending", result, id);
            return;
        }
        self.timers.cancel(DispatcherTimer::SendResponse(id));

        if result.is_ok() && self.demo.needs_alignment_wait(self.is_aligned) {
            debug!("demo mode: datagram {} was sent, waiting for the device to be aligned", id);
            if let Some(previous) = self.alignment.hold((), id) {
                warn!("replacing datagram {} that was waiting for alignment", previous);
            }
            self.timers.schedule(DispatcherTimer::Alignment, self.demo.align_timeout());
            return;
        }

        self.complete(id, result);
    }

    fn complete(&mut self, id: DatagramId, result: SatelliteResult) {
        self.in_flight = None;
        let Some(entry) = self.queues.remove(id) else {
            warn!("datagram {} was completed but is not queued", id);
            return;
        };

        debug!("datagram {} completed with {:?}: size ~{} bytes, {:?} after queueing",
            id, result, entry.datagram.rounded_size_bytes(), entry.enqueued_at.elapsed());

        match result {
            Ok(()) => self.on_send_succeeded(entry),
            Err(e) => self.on_send_failed(entry, e),
        }
    }

    fn on_send_succeeded(&mut self, entry: PendingSendEntry) {
        let subscription_id = entry.subscription_id;
        let datagram_type = entry.datagram_type;
        let num_pending = self.queues.len() as i32;

        self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::new(DatagramTransferState::SendSuccess, num_pending));

        if self.demo.is_enabled() && datagram_type.is_emergency() {
            self.receiver.schedule_demo_poll(subscription_id);
        }

        if self.queues.is_empty() {
            self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::idle());
            entry.complete(Ok(()));
        }
        else {
            entry.complete(Ok(()));
            self.send_next();
        }
    }

    /// A failed send fails everything that is still queued: the link is most likely down, and
    ///  callers get a prompt and consistent answer instead of a string of timeouts.
    fn on_send_failed(&mut self, entry: PendingSendEntry, error: SatelliteError) {
        warn!("sending datagram {} failed with {}, aborting {} queued datagrams", entry.id, error, self.queues.len());

        let subscription_id = entry.subscription_id;
        let datagram_type = entry.datagram_type;

        self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::failed(DatagramTransferState::SendFailed, self.queues.len() as i32, error));
        self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::idle());
        entry.complete(Err(error));

        self.abort_all(SatelliteError::RequestAborted);
    }

    fn fail_and_abort(&mut self, id: DatagramId, error: SatelliteError) {
        self.in_flight = None;
        self.timers.cancel(DispatcherTimer::SendResponse(id));
        if let Some(entry) = self.queues.remove(id) {
            self.on_send_failed(entry, error);
        }
    }

    fn abort_all(&mut self, error: SatelliteError) {
        self.in_flight = None;
        self.timers.cancel_where(|t| matches!(t, DispatcherTimer::SendResponse(_)));
        if let Some(((), id)) = self.alignment.release_all().into_iter().next() {
            debug!("dropping datagram {} that was waiting for alignment", id);
            self.timers.cancel(DispatcherTimer::Alignment);
        }

        for entry in self.queues.drain_all() {
            debug!("aborting datagram {}", entry.id);
            entry.complete(Err(error));
        }
    }

    fn on_modem_state_changed(&mut self, state: SatelliteModemState) {
        debug!("modem state changed to {:?}", state);
        match state {
            SatelliteModemState::Off | SatelliteModemState::Unavailable => self.clean_up(),
            SatelliteModemState::Idle => self.send_next(),
            _ => {}
        }
    }

    /// nothing queued can make progress once the modem is off
    fn clean_up(&mut self) {
        self.is_aligned = false;

        let head = self.queues.next_eligible()
            .map(|e| (e.subscription_id, e.datagram_type));
        if let Some((subscription_id, datagram_type)) = head {
            info!("modem went away, aborting {} queued datagrams", self.queues.len());
            self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::failed(DatagramTransferState::SendFailed, 0, SatelliteError::RequestAborted));
            self.controller.update_send_status(subscription_id, datagram_type, TransferStatus::idle());
        }
        self.abort_all(SatelliteError::RequestAborted);
    }

    fn on_device_aligned(&mut self, is_aligned: bool) {
        debug!("device aligned with satellite: {}", is_aligned);
        self.is_aligned = is_aligned;
        if !is_aligned || !self.demo.is_enabled() {
            return;
        }

        if self.timers.cancel(DispatcherTimer::Alignment) {
            if let Some(id) = self.alignment.release(()) {
                debug!("device is aligned, completing datagram {}", id);
                self.complete(id, Ok(()));
            }
        }
    }

    fn on_timer(&mut self, timer: DispatcherTimer) {
        match timer {
            DispatcherTimer::SendResponse(id) => self.on_send_response_timeout(id),
            DispatcherTimer::Alignment => {
                if let Some(id) = self.alignment.release(()) {
                    warn!("device was not aligned with the satellite in time, datagram {} failed", id);
                    self.complete(id, Err(SatelliteError::NotReachable));
                }
            }
        }
    }

    fn on_send_response_timeout(&mut self, id: DatagramId) {
        if self.in_flight != Some(id) {
            return;
        }
        let Some(entry) = self.queues.get(id) else {
            return;
        };
        warn!("no response from the modem for datagram {} after {:?}", id, self.config.send_response_timeout);

        let subscription_id = entry.subscription_id;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.abort_sending_datagrams(subscription_id).await {
                warn!("could not abort sending datagrams at the modem: {}", e);
            }
        });

        self.fail_and_abort(id, SatelliteError::ModemTimeout);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time;

    use crate::modem::transport::MockSatelliteTransport;
    use crate::session::SessionHandle;
    use crate::test_util::transport::{ScriptedTransport, TransportRequest, TransportScript};
    use crate::transfer::receiver::ReceiverMessage;
    use super::*;

    struct Fixture {
        dispatcher: DispatcherHandle,
        controller: Arc<DatagramController>,
        demo: Arc<DemoModeConfig>,
        script: TransportScript,
        receiver: UnboundedReceiver<ReceiverMessage>,
        _session: UnboundedReceiver<crate::session::SessionMessage>,
    }

    fn fixture_with_transport(transport: Arc<dyn SatelliteTransport>, script: TransportScript) -> Fixture {
        let config = Arc::new(SatelliteConfig::new());
        let demo = Arc::new(DemoModeConfig::new(&config));

        let (dispatcher_send, dispatcher_recv) = mpsc::unbounded_channel();
        let (receiver_send, receiver) = mpsc::unbounded_channel();
        let (session_send, session) = mpsc::unbounded_channel();

        let dispatcher = DispatcherHandle::new(dispatcher_send.clone());
        let controller = Arc::new(DatagramController::new(SessionHandle::new(session_send), dispatcher.clone()));

        let actor = Dispatcher::new(config, demo.clone(), controller.clone(), transport, ReceiverHandle::new(receiver_send), dispatcher_send);
        tokio::spawn(actor.run(dispatcher_recv));

        Fixture {
            dispatcher,
            controller,
            demo,
            script,
            receiver,
            _session: session,
        }
    }

    fn fixture() -> Fixture {
        let (transport, script) = ScriptedTransport::new();
        fixture_with_transport(transport, script)
    }

    fn spawn_send(f: &Fixture, datagram_type: DatagramType, payload: &'static str) -> tokio::task::JoinHandle<SatelliteResult> {
        let dispatcher = f.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.send_datagram(1, datagram_type, Datagram::new(payload), false).await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_send_success() {
        let mut f = fixture();
        let mut events = f.controller.subscribe();

        let result = spawn_send(&f, DatagramType::Emergency, "sos");

        let (datagram, _, completion) = f.script.expect_send().await;
        assert_eq!(datagram, Datagram::new("sos"));
        completion.send(Ok(())).unwrap();

        assert_eq!(result.await.unwrap(), Ok(()));

        let states = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| match e {
                crate::transfer::transfer_events::TransferEvent::SendStateChanged(data) => data.status.state,
                _ => DatagramTransferState::Unknown,
            })
            .collect::<Vec<_>>();
        assert_eq!(states, vec![DatagramTransferState::Sending, DatagramTransferState::SendSuccess, DatagramTransferState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_sent_before_normal() {
        let mut f = fixture();

        let first = spawn_send(&f, DatagramType::Normal, "n1");
        let (datagram, _, first_completion) = f.script.expect_send().await;
        assert_eq!(datagram, Datagram::new("n1"));

        let normal = spawn_send(&f, DatagramType::Normal, "n2");
        time::sleep(Duration::from_millis(1)).await;
        let emergency = spawn_send(&f, DatagramType::Emergency, "e1");
        time::sleep(Duration::from_millis(1)).await;

        // single flight: nothing else reaches the transport before the first send completes
        assert!(f.script.try_next_request().is_none());

        first_completion.send(Ok(())).unwrap();
        let (datagram, datagram_type, completion) = f.script.expect_send().await;
        assert_eq!(datagram, Datagram::new("e1"));
        assert_eq!(datagram_type, DatagramType::Emergency);
        completion.send(Ok(())).unwrap();

        let (datagram, _, completion) = f.script.expect_send().await;
        assert_eq!(datagram, Datagram::new("n2"));
        completion.send(Ok(())).unwrap();

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(emergency.await.unwrap(), Ok(()));
        assert_eq!(normal.await.unwrap(), Ok(()));
        assert!(f.controller.is_sending_in_idle_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_aborts_queue() {
        let mut f = fixture();

        let e1 = spawn_send(&f, DatagramType::Emergency, "e1");
        let (_, _, completion) = f.script.expect_send().await;
        let n1 = spawn_send(&f, DatagramType::Normal, "n1");
        let e2 = spawn_send(&f, DatagramType::Emergency, "e2");
        time::sleep(Duration::from_millis(1)).await;

        completion.send(Err(SatelliteError::ModemError)).unwrap();

        assert_eq!(e1.await.unwrap(), Err(SatelliteError::ModemError));
        assert_eq!(n1.await.unwrap(), Err(SatelliteError::RequestAborted));
        assert_eq!(e2.await.unwrap(), Err(SatelliteError::RequestAborted));
        assert!(f.controller.is_sending_in_idle_state());

        // the engine accepts new requests afterwards
        let next = spawn_send(&f, DatagramType::Normal, "n2");
        let (datagram, _, completion) = f.script.expect_send().await;
        assert_eq!(datagram, Datagram::new("n2"));
        completion.send(Ok(())).unwrap();
        assert_eq!(next.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_for_receive_side() {
        let mut f = fixture();
        f.controller.try_start_polling(1, true).unwrap();

        let result = spawn_send(&f, DatagramType::Normal, "n1");
        time::sleep(Duration::from_millis(1)).await;
        assert!(f.script.try_next_request().is_none());

        f.controller.update_receive_status(1, TransferStatus::idle());

        let (_, _, completion) = f.script.expect_send().await;
        completion.send(Ok(())).unwrap();
        assert_eq!(result.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_response_timeout() {
        let (transport, script) = ScriptedTransport::new();
        let mut f = fixture_with_transport(transport.clone(), script);

        let first = spawn_send(&f, DatagramType::Emergency, "e1");
        let (_, _, completion) = f.script.expect_send().await;
        let second = spawn_send(&f, DatagramType::Normal, "n1");

        assert_eq!(first.await.unwrap(), Err(SatelliteError::ModemTimeout));
        assert_eq!(second.await.unwrap(), Err(SatelliteError::RequestAborted));
        time::sleep(Duration::from_millis(1)).await;
        assert!(transport.calls().contains(&crate::test_util::transport::TransportCall::AbortSending(1)));

        // the late completion is ignored
        let _ = completion.send(Ok(()));
        time::sleep(Duration::from_millis(1)).await;
        assert!(f.controller.is_sending_in_idle_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_transport() {
        let mut transport = MockSatelliteTransport::new();
        transport.expect_is_available()
            .return_const(false);
        transport.expect_send_datagram()
            .never();

        let (_, script) = ScriptedTransport::new();
        let f = fixture_with_transport(Arc::new(transport), script);

        let result = spawn_send(&f, DatagramType::Emergency, "e1");
        assert_eq!(result.await.unwrap(), Err(SatelliteError::InvalidTelephonyState));
        assert!(f.controller.is_sending_in_idle_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_off_aborts_queue() {
        let mut f = fixture();

        let first = spawn_send(&f, DatagramType::Emergency, "e1");
        let (_, _, _completion) = f.script.expect_send().await;
        let second = spawn_send(&f, DatagramType::Normal, "n1");
        time::sleep(Duration::from_millis(1)).await;

        f.dispatcher.on_modem_state_changed(SatelliteModemState::Off);

        assert_eq!(first.await.unwrap(), Err(SatelliteError::RequestAborted));
        assert_eq!(second.await.unwrap(), Err(SatelliteError::RequestAborted));
        assert!(f.controller.is_sending_in_idle_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_mode_waits_for_alignment() {
        let mut f = fixture();
        f.demo.set_enabled(true);

        let result = spawn_send(&f, DatagramType::Emergency, "sos");
        let (_, _, completion) = f.script.expect_send().await;
        completion.send(Ok(())).unwrap();

        time::sleep(Duration::from_secs(1)).await;
        assert!(!result.is_finished());
        assert!(f.controller.has_demo_datagram());

        f.dispatcher.set_device_aligned(true);
        assert_eq!(result.await.unwrap(), Ok(()));

        match f.receiver.recv().await {
            Some(ReceiverMessage::ScheduleDemoPoll { subscription_id }) => assert_eq!(subscription_id, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_mode_alignment_timeout() {
        let mut f = fixture();
        f.demo.set_enabled(true);

        let first = spawn_send(&f, DatagramType::Emergency, "sos");
        let (_, _, completion) = f.script.expect_send().await;
        let second = spawn_send(&f, DatagramType::Normal, "n1");
        completion.send(Ok(())).unwrap();

        let start = Instant::now();
        assert_eq!(first.await.unwrap(), Err(SatelliteError::NotReachable));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(second.await.unwrap(), Err(SatelliteError::RequestAborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_pending() {
        let mut f = fixture();

        let result = spawn_send(&f, DatagramType::Normal, "n1");
        let _request: TransportRequest = f.script.next_request().await.unwrap();

        f.dispatcher.shutdown();
        assert_eq!(result.await.unwrap(), Err(SatelliteError::RequestAborted));
        assert_eq!(f.dispatcher.send_datagram(1, DatagramType::Normal, Datagram::new("x"), false).await, Err(SatelliteError::RequestAborted));
    }
}
