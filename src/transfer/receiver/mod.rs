use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::{SatelliteConfig, SubscriptionValidator};
use crate::datagram::datagram_id::{DatagramId, DurableIdAllocator};
use crate::datagram::datagram_store::DatagramStore;
use crate::datagram::{Datagram, SubscriptionId};
use crate::listener::{DatagramAck, DatagramListener, ListenerId};
use crate::modem::transport::{IncomingDatagramSink, SatelliteTransport};
use crate::modem::SatelliteModemState;
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::transfer::controller::DatagramController;
use crate::transfer::demo_mode::{AlignmentGate, DemoModeConfig};
use crate::transfer::receiver::listener_registry::ListenerRegistry;
use crate::transfer::receiver::pending_acks::{AckOutcome, PendingAcks};
use crate::transfer::transfer_state::{DatagramTransferState, TransferStatus};
use crate::util::timers::{TimerToken, Timers};

pub mod listener_registry;
pub mod pending_acks;

pub(crate) enum ReceiverMessage {
    Poll {
        subscription_id: SubscriptionId,
        reply: oneshot::Sender<SatelliteResult>,
    },
    PollDone {
        result: SatelliteResult,
    },
    DatagramReceived {
        subscription_id: SubscriptionId,
        datagram: Option<Datagram>,
        pending_count: i32,
    },
    Ack {
        id: DatagramId,
        listener: ListenerId,
    },
    Register {
        subscription_id: SubscriptionId,
        listener: Arc<dyn DatagramListener>,
        reply: oneshot::Sender<SatelliteResult<ListenerId>>,
    },
    Unregister {
        subscription_id: SubscriptionId,
        listener: ListenerId,
    },
    ScheduleDemoPoll {
        subscription_id: SubscriptionId,
    },
    ModemStateChanged(SatelliteModemState),
    DeviceAligned(bool),
    TimerFired(ReceiverTimer, TimerToken),
    Shutdown,
}

impl std::fmt::Debug for ReceiverMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverMessage::Poll { subscription_id, .. } => write!(f, "Poll({})", subscription_id),
            ReceiverMessage::PollDone { result } => write!(f, "PollDone({:?})", result),
            ReceiverMessage::DatagramReceived { subscription_id, datagram, pending_count } => {
                write!(f, "DatagramReceived({}, {:?} bytes, {} pending)", subscription_id, datagram.as_ref().map(|d| d.len()), pending_count)
            }
            ReceiverMessage::Ack { id, listener } => write!(f, "Ack({}, {})", id, listener),
            ReceiverMessage::Register { subscription_id, .. } => write!(f, "Register({})", subscription_id),
            ReceiverMessage::Unregister { subscription_id, listener } => write!(f, "Unregister({}, {})", subscription_id, listener),
            ReceiverMessage::ScheduleDemoPoll { subscription_id } => write!(f, "ScheduleDemoPoll({})", subscription_id),
            ReceiverMessage::ModemStateChanged(state) => write!(f, "ModemStateChanged({:?})", state),
            ReceiverMessage::DeviceAligned(is_aligned) => write!(f, "DeviceAligned({})", is_aligned),
            ReceiverMessage::TimerFired(timer, token) => write!(f, "TimerFired({:?}, {:?})", timer, token),
            ReceiverMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum ReceiverTimer {
    AckRetry(DatagramId, ListenerId),
    Alignment(SubscriptionId),
    DemoPoll(SubscriptionId),
}

/// Client side of the receiver actor
#[derive(Clone, Debug)]
pub struct ReceiverHandle {
    sender: mpsc::UnboundedSender<ReceiverMessage>,
}

impl ReceiverHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<ReceiverMessage>) -> ReceiverHandle {
        ReceiverHandle { sender }
    }

    /// Resolves when the poll request was answered by the modem. Datagrams that the poll
    ///  brings in are delivered to listeners, not returned here.
    pub async fn poll_pending_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult {
        let (reply, result) = oneshot::channel();
        if self.sender.send(ReceiverMessage::Poll { subscription_id, reply }).is_err() {
            return Err(SatelliteError::RequestAborted);
        }
        result.await
            .unwrap_or(Err(SatelliteError::RequestAborted))
    }

    pub async fn register_listener(&self, subscription_id: SubscriptionId, listener: Arc<dyn DatagramListener>) -> SatelliteResult<ListenerId> {
        let (reply, result) = oneshot::channel();
        if self.sender.send(ReceiverMessage::Register { subscription_id, listener, reply }).is_err() {
            return Err(SatelliteError::RequestAborted);
        }
        result.await
            .unwrap_or(Err(SatelliteError::RequestAborted))
    }

    pub fn unregister_listener(&self, subscription_id: SubscriptionId, listener: ListenerId) {
        self.post(ReceiverMessage::Unregister { subscription_id, listener });
    }

    pub fn on_modem_state_changed(&self, state: SatelliteModemState) {
        self.post(ReceiverMessage::ModemStateChanged(state));
    }

    pub fn set_device_aligned(&self, is_aligned: bool) {
        self.post(ReceiverMessage::DeviceAligned(is_aligned));
    }

    /// demo mode: loop the captured datagram back after the configured delay
    pub fn schedule_demo_poll(&self, subscription_id: SubscriptionId) {
        self.post(ReceiverMessage::ScheduleDemoPoll { subscription_id });
    }

    pub fn shutdown(&self) {
        self.post(ReceiverMessage::Shutdown);
    }

    fn post(&self, msg: ReceiverMessage) {
        if self.sender.send(msg).is_err() {
            trace!("receiver is shut down, dropping message");
        }
    }
}

struct PollRequest {
    subscription_id: SubscriptionId,
    /// `None` for polls the receiver issues on its own
    reply: Option<oneshot::Sender<SatelliteResult>>,
    started_at: Instant,
}

impl PollRequest {
    fn complete(self, result: SatelliteResult) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!("internal poll for subscription {} completed with {:?}", self.subscription_id, result),
        }
    }
}

/// Polls the transport for incoming datagrams and delivers them to listeners until every
///  listener acknowledged.
pub(crate) struct Receiver {
    config: Arc<SatelliteConfig>,
    demo: Arc<DemoModeConfig>,
    controller: Arc<DatagramController>,
    transport: Arc<dyn SatelliteTransport>,
    store: Arc<dyn DatagramStore>,
    subscriptions: Arc<dyn SubscriptionValidator>,
    ids: DurableIdAllocator,
    mailbox: mpsc::UnboundedSender<ReceiverMessage>,
    listeners: ListenerRegistry,
    pending_acks: PendingAcks,
    timers: Timers<ReceiverTimer, ReceiverMessage>,
    in_flight_poll: Option<PollRequest>,
    /// the modem's last `(subscription, pending count)` report that arrived before it answered
    ///  the poll in flight; acted on once the poll completes
    report_during_poll: Option<(SubscriptionId, i32)>,
    /// demo mode: polls waiting for the device to be aligned
    alignment: AlignmentGate<SubscriptionId, PollRequest>,
    is_aligned: bool,
}

impl Receiver {
    pub(crate) fn new(
        config: Arc<SatelliteConfig>,
        demo: Arc<DemoModeConfig>,
        controller: Arc<DatagramController>,
        transport: Arc<dyn SatelliteTransport>,
        store: Arc<dyn DatagramStore>,
        subscriptions: Arc<dyn SubscriptionValidator>,
        ids: DurableIdAllocator,
        mailbox: mpsc::UnboundedSender<ReceiverMessage>,
    ) -> Receiver {
        Receiver {
            config,
            demo,
            controller,
            transport,
            store,
            subscriptions,
            ids,
            timers: Timers::new(mailbox.clone(), ReceiverMessage::TimerFired),
            mailbox,
            listeners: ListenerRegistry::new(),
            pending_acks: PendingAcks::new(),
            in_flight_poll: None,
            report_during_poll: None,
            alignment: AlignmentGate::new(),
            is_aligned: false,
        }
    }

    pub(crate) async fn run(self, recv: mpsc::UnboundedReceiver<ReceiverMessage>) {
        self.do_run(recv)
            .instrument(info_span!("receiver"))
            .await
    }

    async fn do_run(mut self, mut recv: mpsc::UnboundedReceiver<ReceiverMessage>) {
        info!("starting");
        while let Some(msg) = recv.recv().await {
            trace!("received {:?}", msg);
            match msg {
                ReceiverMessage::Poll { subscription_id, reply } => self.start_poll(subscription_id, Some(reply), true),
                ReceiverMessage::PollDone { result } => self.on_poll_done(result),
                ReceiverMessage::DatagramReceived { subscription_id, datagram, pending_count } => self.on_datagram_received(subscription_id, datagram, pending_count),
                ReceiverMessage::Ack { id, listener } => self.on_ack(id, listener),
                ReceiverMessage::Register { subscription_id, listener, reply } => {
                    let _ = reply.send(self.register(subscription_id, listener));
                }
                ReceiverMessage::Unregister { subscription_id, listener } => self.unregister(subscription_id, listener),
                ReceiverMessage::ScheduleDemoPoll { subscription_id } => {
                    self.timers.schedule(ReceiverTimer::DemoPoll(subscription_id), self.demo.poll_delay());
                }
                ReceiverMessage::ModemStateChanged(state) => self.on_modem_state_changed(state),
                ReceiverMessage::DeviceAligned(is_aligned) => self.on_device_aligned(is_aligned),
                ReceiverMessage::TimerFired(timer, token) => {
                    if self.timers.fire(timer, token) {
                        self.on_timer(timer);
                    }
                }
                ReceiverMessage::Shutdown => {
                    self.abort_polls();
                    break;
                }
            }
        }
        self.timers.cancel_all();
        info!("shut down");
    }

    fn register(&mut self, subscription_id: SubscriptionId, listener: Arc<dyn DatagramListener>) -> SatelliteResult<ListenerId> {
        let id = ListenerId::new();
        let is_first = self.listeners.register(subscription_id, id, listener);
        debug!("registered datagram listener {} for subscription {}", id, subscription_id);

        if is_first {
            let mailbox = self.mailbox.clone();
            let sink = IncomingDatagramSink::new(move |datagram, pending_count| {
                let _ = mailbox.send(ReceiverMessage::DatagramReceived { subscription_id, datagram, pending_count });
            });
            if let Err(e) = self.transport.register_for_datagrams_received(subscription_id, sink) {
                warn!("could not register for incoming datagrams on subscription {}: {}", subscription_id, e);
                self.listeners.unregister(subscription_id, id);
                return Err(e);
            }
        }
        Ok(id)
    }

    fn unregister(&mut self, subscription_id: SubscriptionId, listener: ListenerId) {
        match self.listeners.unregister(subscription_id, listener) {
            Some(true) => {
                debug!("last datagram listener for subscription {} is gone", subscription_id);
                self.transport.unregister_for_datagrams_received(subscription_id);
            }
            Some(false) => debug!("unregistered datagram listener {}", listener),
            None => debug!("datagram listener {} is not registered for subscription {}", listener, subscription_id),
        }
    }

    fn start_poll(&mut self, subscription_id: SubscriptionId, reply: Option<oneshot::Sender<SatelliteResult>>, is_new_receive: bool) {
        let request = PollRequest {
            subscription_id,
            reply,
            started_at: Instant::now(),
        };

        if self.in_flight_poll.is_some() || !self.alignment.is_empty() {
            // the transport is single-flight, and the outstanding poll owns the receive state
            debug!("a poll is still outstanding, not polling subscription {}", subscription_id);
            request.complete(Err(SatelliteError::ModemBusy));
            return;
        }

        if let Err(e) = self.controller.try_start_polling(subscription_id, is_new_receive) {
            if !is_new_receive {
                // datagrams stay pending at the modem until the next poll
                self.controller.update_receive_status(subscription_id, TransferStatus::idle());
            }
            request.complete(Err(e));
            return;
        }

        if !self.transport.is_available() {
            error!("no satellite transport, cannot poll for datagrams");
            self.finish_poll(request, Err(SatelliteError::InvalidTelephonyState));
            return;
        }

        if self.demo.is_enabled() {
            if self.demo.needs_alignment_wait(self.is_aligned) {
                debug!("demo mode: poll for subscription {} waits for the device to be aligned", subscription_id);
                if let Some(previous) = self.alignment.hold(subscription_id, request) {
                    previous.complete(Err(SatelliteError::RequestAborted));
                }
                self.timers.schedule(ReceiverTimer::Alignment(subscription_id), self.demo.align_timeout());
            }
            else {
                self.finish_poll(request, Ok(()));
            }
            return;
        }

        debug!("polling for datagrams on subscription {}", subscription_id);
        self.in_flight_poll = Some(request);

        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = transport.poll_pending_datagrams(subscription_id).await;
            let _ = mailbox.send(ReceiverMessage::PollDone { result });
        });
    }

    fn on_poll_done(&mut self, result: SatelliteResult) {
        let Some(request) = self.in_flight_poll.take() else {
            warn!("ignoring poll completion {:?} that is no longer expected", result);
            return;
        };

        let report = self.report_during_poll.take();
        if result.is_ok() {
            if let Some((subscription_id, pending_count)) = report {
                self.continue_receiving(subscription_id, pending_count);
            }
        }
        self.finish_poll(request, result);
    }

    fn finish_poll(&mut self, request: PollRequest, mut result: SatelliteResult) {
        let subscription_id = request.subscription_id;

        if result.is_ok() && self.demo.is_enabled() {
            if self.listeners.has_listeners(subscription_id) {
                let datagram = self.controller.take_demo_datagram();
                debug!("demo mode: looping back {:?}", datagram.as_ref().map(|d| d.len()));
                self.on_datagram_received(subscription_id, datagram, 0);
            }
            else {
                warn!("demo mode: no datagram listener for subscription {}", subscription_id);
                result = Err(SatelliteError::InvalidTelephonyState);
            }
        }

        if let Err(e) = result {
            warn!("polling for datagrams on subscription {} failed: {}", subscription_id, e);
            debug!("poll failed after {:?}", request.started_at.elapsed());
            let pending_count = self.controller.receive_pending_count();
            self.controller.update_receive_status(subscription_id, TransferStatus::failed(DatagramTransferState::ReceiveFailed, pending_count, e));
            self.controller.update_receive_status(subscription_id, TransferStatus::new(DatagramTransferState::Idle, pending_count));
        }
        request.complete(result);
    }

    fn on_datagram_received(&mut self, subscription_id: SubscriptionId, datagram: Option<Datagram>, pending_count: i32) {
        match datagram {
            None if pending_count <= 0 => {
                debug!("no datagrams pending for subscription {}", subscription_id);
                self.controller.update_receive_status(subscription_id, TransferStatus::new(DatagramTransferState::ReceiveNone, pending_count));
            }
            None => {}
            Some(datagram) => {
                self.controller.update_receive_status(subscription_id, TransferStatus::new(DatagramTransferState::ReceiveSuccess, pending_count));

                let id = self.ids.allocate();
                debug!("received datagram {} for subscription {}: size ~{} bytes, {} more pending", id, subscription_id, datagram.rounded_size_bytes(), pending_count);

                if let Err(e) = self.store.insert(subscription_id, id, &datagram) {
                    error!("could not store received datagram {}: {}", id, e);
                }

                let listeners = self.listeners.listeners_for(subscription_id);
                if listeners.is_empty() {
                    warn!("no listener for received datagram {}, it stays in the store", id);
                }
                else {
                    self.pending_acks.insert(id, subscription_id, datagram, pending_count, &listeners);
                    for (listener_id, listener) in listeners {
                        self.deliver(id, listener_id, listener);
                    }
                }
            }
        }

        if self.in_flight_poll.is_some() {
            trace!("the modem did not answer the poll yet, continuing once it does");
            self.report_during_poll = Some((subscription_id, pending_count));
        }
        else {
            self.continue_receiving(subscription_id, pending_count);
        }
    }

    /// polls again while the modem reports pending datagrams, goes idle otherwise
    fn continue_receiving(&mut self, subscription_id: SubscriptionId, pending_count: i32) {
        if pending_count > 0 {
            self.start_poll(subscription_id, None, false);
        }
        else {
            self.controller.update_receive_status(subscription_id, TransferStatus::new(DatagramTransferState::Idle, pending_count));
        }
    }

    /// delivers to one listener and waits for its acknowledgement, redelivering until it arrives
    fn deliver(&mut self, id: DatagramId, listener_id: ListenerId, listener: Arc<dyn DatagramListener>) {
        let Some(entry) = self.pending_acks.get(id) else {
            return;
        };
        let subscription_id = entry.subscription_id;

        let mailbox = self.mailbox.clone();
        let ack = DatagramAck::new(move || {
            let _ = mailbox.send(ReceiverMessage::Ack { id, listener: listener_id });
        });

        trace!("delivering datagram {} to listener {}", id, listener_id);
        match listener.on_satellite_datagram_received(id, entry.datagram.clone(), entry.pending_count, ack) {
            Ok(()) => {
                self.timers.schedule(ReceiverTimer::AckRetry(id, listener_id), self.config.ack_timeout);
            }
            Err(e) => {
                info!("datagram listener {} is unreachable, removing it: {}", listener_id, e);
                self.unregister(subscription_id, listener_id);
                for forgotten in self.pending_acks.forget_listener(listener_id) {
                    self.timers.cancel(ReceiverTimer::AckRetry(forgotten, listener_id));
                }
            }
        }
    }

    fn on_ack(&mut self, id: DatagramId, listener: ListenerId) {
        self.timers.cancel(ReceiverTimer::AckRetry(id, listener));

        match self.pending_acks.acknowledge(id, listener) {
            AckOutcome::Complete => {
                debug!("datagram {} was acknowledged by all listeners", id);
                match self.store.delete(id) {
                    Ok(true) => {}
                    Ok(false) => warn!("acknowledged datagram {} was not in the store", id),
                    Err(e) => error!("could not delete acknowledged datagram {}: {}", id, e),
                }
            }
            AckOutcome::Pending(n) => debug!("listener {} acknowledged datagram {}, waiting for {} more", listener, id, n),
            AckOutcome::Duplicate | AckOutcome::Unknown => debug!("ignoring repeated acknowledgement of datagram {} by {}", id, listener),
        }
    }

    fn on_timer(&mut self, timer: ReceiverTimer) {
        match timer {
            ReceiverTimer::AckRetry(id, listener_id) => {
                if let Some(listener) = self.pending_acks.awaiting_listener(id, listener_id) {
                    info!("no acknowledgement for datagram {} from listener {}, delivering again", id, listener_id);
                    self.deliver(id, listener_id, listener);
                }
            }
            ReceiverTimer::Alignment(subscription_id) => {
                if let Some(request) = self.alignment.release(subscription_id) {
                    warn!("device was not aligned with the satellite in time, poll for subscription {} failed", subscription_id);
                    self.finish_poll(request, Err(SatelliteError::NotReachable));
                }
            }
            ReceiverTimer::DemoPoll(subscription_id) => {
                if self.demo.is_enabled() && self.controller.has_demo_datagram() {
                    debug!("demo mode: simulated poll for subscription {}", subscription_id);
                    self.start_poll(subscription_id, None, true);
                }
            }
        }
    }

    fn on_device_aligned(&mut self, is_aligned: bool) {
        debug!("device aligned with satellite: {}", is_aligned);
        self.is_aligned = is_aligned;
        if !is_aligned || !self.demo.is_enabled() {
            return;
        }

        for (subscription_id, request) in self.alignment.release_all() {
            self.timers.cancel(ReceiverTimer::Alignment(subscription_id));
            self.finish_poll(request, Ok(()));
        }
    }

    fn on_modem_state_changed(&mut self, state: SatelliteModemState) {
        debug!("modem state changed to {:?}", state);
        if !state.is_off_or_unavailable() {
            return;
        }

        self.is_aligned = false;
        self.timers.cancel_where(|t| !matches!(t, ReceiverTimer::AckRetry(..)));
        self.abort_polls();

        let status = self.controller.receive_status();
        if !status.is_idle() {
            let subscription_id = self.subscriptions.default_subscription_id();
            if status.state == DatagramTransferState::Receiving {
                self.controller.update_receive_status(subscription_id, TransferStatus::failed(DatagramTransferState::ReceiveFailed, status.pending_count, SatelliteError::RequestAborted));
            }
            self.controller.update_receive_status(subscription_id, TransferStatus::idle());
        }
    }

    fn abort_polls(&mut self) {
        for (_, request) in self.alignment.release_all() {
            request.complete(Err(SatelliteError::RequestAborted));
        }
        self.report_during_poll = None;
        if let Some(request) = self.in_flight_poll.take() {
            request.complete(Err(SatelliteError::RequestAborted));
        }
    }
}
