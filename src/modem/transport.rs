use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::datagram::{Datagram, DatagramType, SubscriptionId};
use crate::result_code::SatelliteResult;

/// The one-shot request / response channel to the satellite modem.
///
/// From the engine's perspective the transport is single-flight: the engine never has a send
///  and a poll outstanding at the same time. Every async call completes exactly once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SatelliteTransport: Send + Sync + 'static {
    /// `false` if there is no underlying modem to talk to at all
    fn is_available(&self) -> bool;

    async fn send_datagram(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, need_full_screen_ui: bool) -> SatelliteResult;

    /// Asks the modem to push pending incoming datagrams. On success, the transport reports
    ///  at least one `(datagram, pending_count)` through the [IncomingDatagramSink] registered
    ///  for the subscription - `(None, 0)` if there was nothing to receive.
    async fn poll_pending_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult;

    async fn request_listening_enabled(&self, enabled: bool, timeout: Duration) -> SatelliteResult;

    async fn enable_cellular_modem_while_satellite_mode_is_on(&self, enabled: bool) -> SatelliteResult;

    /// drop all send requests the modem has not completed yet
    async fn abort_sending_datagrams(&self, subscription_id: SubscriptionId) -> SatelliteResult;

    fn register_for_datagrams_received(&self, subscription_id: SubscriptionId, sink: IncomingDatagramSink) -> SatelliteResult;
    fn unregister_for_datagrams_received(&self, subscription_id: SubscriptionId);
}

/// Binding to the vendor service that hosts the modem gateway
#[cfg_attr(test, automock)]
pub trait GatewayConnection: Send + Sync + 'static {
    fn bind(&self) -> anyhow::Result<()>;
    fn unbind(&self);
}

/// Where the transport reports incoming datagrams for a subscription. `pending_count` is the
///  number of datagrams still waiting at the modem after this one.
#[derive(Clone)]
pub struct IncomingDatagramSink {
    on_received: Arc<dyn Fn(Option<Datagram>, i32) + Send + Sync>,
}

impl IncomingDatagramSink {
    pub fn new(on_received: impl Fn(Option<Datagram>, i32) + Send + Sync + 'static) -> IncomingDatagramSink {
        IncomingDatagramSink {
            on_received: Arc::new(on_received),
        }
    }

    pub fn on_datagram_received(&self, datagram: Option<Datagram>, pending_count: i32) {
        (self.on_received)(datagram, pending_count)
    }
}

impl Debug for IncomingDatagramSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IncomingDatagramSink")
    }
}
