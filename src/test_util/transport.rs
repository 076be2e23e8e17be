use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::modem::transport::{GatewayConnection, IncomingDatagramSink, SatelliteTransport};
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::util::lock;

/// A send or poll that reached the transport and waits for the test to complete it
#[derive(Debug)]
pub enum TransportRequest {
    Send {
        subscription_id: SubscriptionId,
        datagram_type: DatagramType,
        datagram: Datagram,
        need_full_screen_ui: bool,
        completion: oneshot::Sender<SatelliteResult>,
    },
    Poll {
        subscription_id: SubscriptionId,
        completion: oneshot::Sender<SatelliteResult>,
    },
}

/// Transport calls that complete right away, recorded in the order they were made
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    ListeningEnabled(bool, Duration),
    CellularScanning(bool),
    AbortSending(SubscriptionId),
    RegisteredForDatagrams(SubscriptionId),
    UnregisteredForDatagrams(SubscriptionId),
}

/// A [SatelliteTransport] whose sends and polls are completed explicitly by test code through
///  the [TransportScript] it is created with. Everything else succeeds immediately and is
///  recorded, see [ScriptedTransport::calls].
pub struct ScriptedTransport {
    is_available: AtomicBool,
    requests: mpsc::UnboundedSender<TransportRequest>,
    calls: Mutex<Vec<TransportCall>>,
    sinks: Mutex<FxHashMap<SubscriptionId, IncomingDatagramSink>>,
    num_in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<ScriptedTransport>, TransportScript) {
        let (requests, recv) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            is_available: AtomicBool::new(true),
            requests,
            calls: Default::default(),
            sinks: Default::default(),
            num_in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        };
        (Arc::new(transport), TransportScript { requests: recv })
    }

    pub fn set_available(&self, is_available: bool) {
        self.is_available.store(is_available, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    /// the largest number of sends and polls that were pending at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    /// Pushes an incoming datagram the way the modem does after a poll. Returns `false` if
    ///  nobody is registered for the subscription.
    pub fn deliver_incoming(&self, subscription_id: SubscriptionId, datagram: Option<Datagram>, pending_count: i32) -> bool {
        let sink = lock(&self.sinks).get(&subscription_id).cloned();
        match sink {
            Some(sink) => {
                sink.on_datagram_received(datagram, pending_count);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    async fn await_completion(&self, request: TransportRequest, completion: oneshot::Receiver<SatelliteResult>) -> SatelliteResult {
        let num_in_flight = self.num_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(num_in_flight, Ordering::AcqRel);

        let result = if self.requests.send(request).is_ok() {
            completion.await
                .unwrap_or(Err(SatelliteError::RequestAborted))
        }
        else {
            Err(SatelliteError::RequestAborted)
        };

        self.num_in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

#[async_trait]
impl SatelliteTransport for ScriptedTransport {
    fn is_available(&self) -> bool {
        self.is_available.load(Ordering::Acquire)
    }

    async fn send_datagram(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, need_full_screen_ui: bool) -> SatelliteResult {
        let (completion, result) = oneshot::channel();
        self.await_completion(TransportRequest::Send { subscription_id, datagram_type, datagram, need_full_screen_ui, completion }, result).await
    }

    async fn poll_pending_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult {
        let (completion, result) = oneshot::channel();
        self.await_completion(TransportRequest::Poll { subscription_id, completion }, result).await
    }

    async fn request_listening_enabled(&self, enabled: bool, timeout: Duration) -> SatelliteResult {
        self.record(TransportCall::ListeningEnabled(enabled, timeout));
        Ok(())
    }

    async fn enable_cellular_modem_while_satellite_mode_is_on(&self, enabled: bool) -> SatelliteResult {
        self.record(TransportCall::CellularScanning(enabled));
        Ok(())
    }

    async fn abort_sending_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult {
        self.record(TransportCall::AbortSending(subscription_id));
        Ok(())
    }

    fn register_for_datagrams_received(&self, subscription_id: SubscriptionId, sink: IncomingDatagramSink) -> SatelliteResult {
        self.record(TransportCall::RegisteredForDatagrams(subscription_id));
        lock(&self.sinks).insert(subscription_id, sink);
        Ok(())
    }

    fn unregister_for_datagrams_received(&self, subscription_id: SubscriptionId) {
        self.record(TransportCall::UnregisteredForDatagrams(subscription_id));
        lock(&self.sinks).remove(&subscription_id);
    }
}

/// The test's end of a [ScriptedTransport]
pub struct TransportScript {
    requests: mpsc::UnboundedReceiver<TransportRequest>,
}

impl TransportScript {
    pub async fn next_request(&mut self) -> Option<TransportRequest> {
        self.requests.recv().await
    }

    pub fn try_next_request(&mut self) -> Option<TransportRequest> {
        self.requests.try_recv().ok()
    }

    /// waits for the next request and panics unless it is a send
    pub async fn expect_send(&mut self) -> (Datagram, DatagramType, oneshot::Sender<SatelliteResult>) {
        match self.next_request().await {
            Some(TransportRequest::Send { datagram, datagram_type, completion, .. }) => (datagram, datagram_type, completion),
            other => panic!("expected a send request, was {:?}", other),
        }
    }

    /// waits for the next request and panics unless it is a poll
    pub async fn expect_poll(&mut self) -> (SubscriptionId, oneshot::Sender<SatelliteResult>) {
        match self.next_request().await {
            Some(TransportRequest::Poll { subscription_id, completion }) => (subscription_id, completion),
            other => panic!("expected a poll request, was {:?}", other),
        }
    }
}

/// A [GatewayConnection] that always binds successfully and counts how often it was asked to
#[derive(Debug, Default)]
pub struct RecordingGateway {
    is_bound: AtomicBool,
    num_binds: AtomicUsize,
}

impl RecordingGateway {
    pub fn new() -> RecordingGateway {
        Default::default()
    }

    pub fn is_bound(&self) -> bool {
        self.is_bound.load(Ordering::Acquire)
    }

    pub fn num_binds(&self) -> usize {
        self.num_binds.load(Ordering::Acquire)
    }
}

impl GatewayConnection for RecordingGateway {
    fn bind(&self) -> anyhow::Result<()> {
        self.num_binds.fetch_add(1, Ordering::AcqRel);
        self.is_bound.store(true, Ordering::Release);
        Ok(())
    }

    fn unbind(&self) {
        self.is_bound.store(false, Ordering::Release);
    }
}
