use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::result_code::{SatelliteError, SatelliteResult};
use crate::session::SessionHandle;
use crate::transfer::dispatcher::DispatcherHandle;
use crate::transfer::transfer_events::{TransferEvent, TransferEventNotifier, TransferStateChangedData};
use crate::transfer::transfer_state::{DatagramTransferState, TransferStatus};
use crate::util::lock;

#[derive(Debug)]
struct TransferStates {
    send: TransferStatus,
    receive: TransferStatus,
}

/// Canonical send and receive transfer state.
///
/// Dispatcher and receiver share a single-flight transport, so neither may start work while
///  the other side is busy. All reads and writes go through one lock, and the decision to
///  start a send or a poll is made in the same critical section that marks it as started
///  (see [DatagramController::try_start_sending] and [DatagramController::try_start_polling]).
///
/// Every change is forwarded to the session state machine and to transfer event subscribers
///  while the lock is held, so both observe changes in the order they were made.
pub struct DatagramController {
    states: Mutex<TransferStates>,
    demo_datagram: Mutex<Option<Datagram>>,
    session: SessionHandle,
    dispatcher: DispatcherHandle,
    events: TransferEventNotifier,
}

impl DatagramController {
    pub fn new(session: SessionHandle, dispatcher: DispatcherHandle) -> DatagramController {
        DatagramController {
            states: Mutex::new(TransferStates {
                send: TransferStatus::idle(),
                receive: TransferStatus::idle(),
            }),
            demo_datagram: Mutex::new(None),
            session,
            dispatcher,
            events: TransferEventNotifier::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn update_send_status(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, status: TransferStatus) {
        let mut states = lock(&self.states);
        self.do_update_send_status(&mut states, subscription_id, datagram_type, status);
    }

    pub fn update_receive_status(&self, subscription_id: SubscriptionId, status: TransferStatus) {
        let is_idle = {
            let mut states = lock(&self.states);
            self.do_update_receive_status(&mut states, subscription_id, status);
            states.receive.is_idle()
        };

        if is_idle {
            // a send may have been queued while we were receiving
            self.dispatcher.retry_sending_datagrams();
        }
    }

    fn do_update_send_status(&self, states: &mut TransferStates, subscription_id: SubscriptionId, datagram_type: DatagramType, status: TransferStatus) {
        debug!("send status for subscription {} ({:?}): {:?}", subscription_id, datagram_type, status);
        states.send = status;
        self.session.on_transfer_state_changed(states.send.state, states.receive.state);
        self.events.send_event(TransferEvent::SendStateChanged(TransferStateChangedData {
            subscription_id,
            datagram_type: Some(datagram_type),
            status,
        }));
    }

    fn do_update_receive_status(&self, states: &mut TransferStates, subscription_id: SubscriptionId, status: TransferStatus) {
        debug!("receive status for subscription {}: {:?}", subscription_id, status);
        states.receive = status;
        self.session.on_transfer_state_changed(states.send.state, states.receive.state);
        self.events.send_event(TransferEvent::ReceiveStateChanged(TransferStateChangedData {
            subscription_id,
            datagram_type: None,
            status,
        }));
    }

    pub fn send_status(&self) -> TransferStatus {
        lock(&self.states).send
    }

    pub fn receive_status(&self) -> TransferStatus {
        lock(&self.states).receive
    }

    pub fn is_sending_in_idle_state(&self) -> bool {
        lock(&self.states).send.is_idle()
    }

    pub fn is_polling_in_idle_state(&self) -> bool {
        lock(&self.states).receive.is_idle()
    }

    pub fn is_receiving_datagrams(&self) -> bool {
        lock(&self.states).receive.state == DatagramTransferState::Receiving
    }

    pub fn receive_pending_count(&self) -> i32 {
        lock(&self.states).receive.pending_count
    }

    /// Marks the send side as `Sending` if the receive side is idle. Returns `false` (and
    ///  changes nothing) if a poll is in progress.
    pub fn try_start_sending(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, pending_count: i32) -> bool {
        let mut states = lock(&self.states);
        if !states.receive.is_idle() {
            trace!("receive side is {:?}, not starting to send", states.receive.state);
            return false;
        }
        self.do_update_send_status(&mut states, subscription_id, datagram_type, TransferStatus::new(DatagramTransferState::Sending, pending_count));
        true
    }

    /// Marks the receive side as `Receiving` if the send side is idle (and, if
    ///  `require_receive_idle`, the receive side as well). Continuation polls for datagrams
    ///  still pending at the modem pass `false` since they are part of an ongoing receive.
    pub fn try_start_polling(&self, subscription_id: SubscriptionId, require_receive_idle: bool) -> SatelliteResult {
        let mut states = lock(&self.states);
        if !states.send.is_idle() || (require_receive_idle && !states.receive.is_idle()) {
            debug!("modem is busy (send: {:?}, receive: {:?}), not polling", states.send.state, states.receive.state);
            return Err(SatelliteError::ModemBusy);
        }
        let pending_count = states.receive.pending_count;
        self.do_update_receive_status(&mut states, subscription_id, TransferStatus::new(DatagramTransferState::Receiving, pending_count));
        Ok(())
    }

    /// demo mode: remember the most recent emergency datagram for looping it back
    pub fn capture_demo_datagram(&self, datagram: Datagram) {
        debug!("capturing demo mode datagram ({} bytes)", datagram.len());
        *lock(&self.demo_datagram) = Some(datagram);
    }

    pub fn take_demo_datagram(&self) -> Option<Datagram> {
        lock(&self.demo_datagram).take()
    }

    pub fn has_demo_datagram(&self) -> bool {
        lock(&self.demo_datagram).is_some()
    }

    pub fn clear_demo_datagram(&self) {
        *lock(&self.demo_datagram) = None;
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;
    use DatagramTransferState::*;
    use crate::session::SessionMessage;
    use crate::session::session_logic::SessionEvent;
    use crate::transfer::dispatcher::DispatcherMessage;
    use super::*;

    struct Fixture {
        controller: DatagramController,
        session: mpsc::UnboundedReceiver<SessionMessage>,
        dispatcher: mpsc::UnboundedReceiver<DispatcherMessage>,
    }

    fn fixture() -> Fixture {
        let (session_send, session) = mpsc::unbounded_channel();
        let (dispatcher_send, dispatcher) = mpsc::unbounded_channel();
        Fixture {
            controller: DatagramController::new(SessionHandle::new(session_send), DispatcherHandle::new(dispatcher_send)),
            session,
            dispatcher,
        }
    }

    fn next_transfer_states(session: &mut mpsc::UnboundedReceiver<SessionMessage>) -> Option<(DatagramTransferState, DatagramTransferState)> {
        match session.try_recv() {
            Ok(SessionMessage::Event(SessionEvent::TransferStateChanged { send, receive })) => Some((send, receive)),
            _ => None,
        }
    }

    #[test]
    fn test_send_blocked_while_receiving() {
        let mut f = fixture();

        assert!(f.controller.try_start_polling(1, true).is_ok());
        assert!(f.controller.is_receiving_datagrams());
        assert!(!f.controller.try_start_sending(1, DatagramType::Emergency, 1));
        assert!(f.controller.is_sending_in_idle_state());

        assert_eq!(next_transfer_states(&mut f.session), Some((Idle, Receiving)));
        assert_eq!(next_transfer_states(&mut f.session), None);
    }

    #[test]
    fn test_poll_blocked_while_sending() {
        let mut f = fixture();

        assert!(f.controller.try_start_sending(1, DatagramType::Normal, 2));
        assert_eq!(f.controller.send_status(), TransferStatus::new(Sending, 2));
        assert_eq!(f.controller.try_start_polling(1, true), Err(SatelliteError::ModemBusy));
        assert_eq!(f.controller.try_start_polling(1, false), Err(SatelliteError::ModemBusy));
        assert!(f.controller.is_polling_in_idle_state());

        assert_eq!(next_transfer_states(&mut f.session), Some((Sending, Idle)));
        assert_eq!(next_transfer_states(&mut f.session), None);
    }

    #[test]
    fn test_continuation_poll_while_receiving() {
        let f = fixture();

        f.controller.update_receive_status(1, TransferStatus::new(ReceiveSuccess, 3));
        assert_eq!(f.controller.try_start_polling(1, true), Err(SatelliteError::ModemBusy));
        assert!(f.controller.try_start_polling(1, false).is_ok());
        assert_eq!(f.controller.receive_status(), TransferStatus::new(Receiving, 3));
        assert_eq!(f.controller.receive_pending_count(), 3);
    }

    #[test]
    fn test_receive_idle_retries_sending() {
        let mut f = fixture();

        f.controller.update_receive_status(1, TransferStatus::new(ReceiveSuccess, 0));
        assert!(f.dispatcher.try_recv().is_err());

        f.controller.update_receive_status(1, TransferStatus::idle());
        assert!(matches!(f.dispatcher.try_recv(), Ok(DispatcherMessage::RetrySending)));
    }

    #[test]
    fn test_events_are_published() {
        let f = fixture();
        let mut events = f.controller.subscribe();

        f.controller.update_send_status(4, DatagramType::Emergency, TransferStatus::failed(SendFailed, 0, SatelliteError::ModemError));
        f.controller.update_receive_status(4, TransferStatus::new(ReceiveNone, 0));

        assert_eq!(events.try_recv().unwrap(), TransferEvent::SendStateChanged(TransferStateChangedData {
            subscription_id: 4,
            datagram_type: Some(DatagramType::Emergency),
            status: TransferStatus::failed(SendFailed, 0, SatelliteError::ModemError),
        }));
        assert_eq!(events.try_recv().unwrap(), TransferEvent::ReceiveStateChanged(TransferStateChangedData {
            subscription_id: 4,
            datagram_type: None,
            status: TransferStatus::new(ReceiveNone, 0),
        }));
    }

    #[test]
    fn test_demo_datagram_is_taken_once() {
        let f = fixture();
        assert!(!f.controller.has_demo_datagram());

        f.controller.capture_demo_datagram(Datagram::new("sos"));
        assert!(f.controller.has_demo_datagram());
        assert_eq!(f.controller.take_demo_datagram(), Some(Datagram::new("sos")));
        assert_eq!(f.controller.take_demo_datagram(), None);

        f.controller.capture_demo_datagram(Datagram::new("sos"));
        f.controller.clear_demo_datagram();
        assert!(!f.controller.has_demo_datagram());
    }
}
