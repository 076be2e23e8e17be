use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use satlink::config::{SatelliteConfig, StaticSubscriptions};
use satlink::datagram::datagram_store::{InMemoryCounterStore, InMemoryDatagramStore};
use satlink::datagram::{Datagram, DatagramType, SubscriptionId};
use satlink::engine::{EngineCollaborators, SatelliteEngine};
use satlink::listener::{ChannelDatagramListener, ChannelModemStateListener};
use satlink::modem::transport::{IncomingDatagramSink, SatelliteTransport};
use satlink::result_code::SatelliteResult;
use satlink::test_util::transport::RecordingGateway;
use satlink::transfer::transfer_events::TransferEvent;
use satlink::util::lock;
use tokio::time;
use tracing::{debug, info, Level};

/// Sends emergency datagrams in demo mode and waits for each of them to come back as a
///  received datagram, with a simulated modem that accepts everything after a short delay.
#[derive(Parser)]
struct Args {
    message: String,

    #[clap(long, default_value_t = 1)]
    count: usize,

    /// simulated time the modem takes per send
    #[clap(long, default_value_t = 500)]
    modem_latency_millis: u64,

    /// how long after each send the device reports being aligned with the satellite
    #[clap(long, default_value_t = 1000)]
    align_after_millis: u64,

    #[clap(long, default_value_t = 2)]
    poll_delay_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoopbackTransport {
    latency: Duration,
    sink: Mutex<Option<IncomingDatagramSink>>,
}

#[async_trait]
impl SatelliteTransport for LoopbackTransport {
    fn is_available(&self) -> bool {
        true
    }

    async fn send_datagram(&self, subscription_id: SubscriptionId, datagram_type: DatagramType, datagram: Datagram, _need_full_screen_ui: bool) -> SatelliteResult {
        debug!("modem: sending {} bytes ({:?}) for subscription {}", datagram.len(), datagram_type, subscription_id);
        time::sleep(self.latency).await;
        Ok(())
    }

    async fn poll_pending_datagrams(&self, _subscription_id: SubscriptionId) -> SatelliteResult {
        time::sleep(self.latency).await;
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.on_datagram_received(None, 0);
        }
        Ok(())
    }

    async fn request_listening_enabled(&self, enabled: bool, timeout: Duration) -> SatelliteResult {
        debug!("modem: listening {} ({:?})", enabled, timeout);
        Ok(())
    }

    async fn enable_cellular_modem_while_satellite_mode_is_on(&self, enabled: bool) -> SatelliteResult {
        debug!("modem: cellular scanning {}", enabled);
        Ok(())
    }

    async fn abort_sending_datagrams(&self, _subscription_id: SubscriptionId) -> SatelliteResult {
        Ok(())
    }

    fn register_for_datagrams_received(&self, _subscription_id: SubscriptionId, sink: IncomingDatagramSink) -> SatelliteResult {
        *lock(&self.sink) = Some(sink);
        Ok(())
    }

    fn unregister_for_datagrams_received(&self, _subscription_id: SubscriptionId) {
        *lock(&self.sink) = None;
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = SatelliteConfig::new();
    config.demo_poll_delay = Duration::from_secs(args.poll_delay_secs);

    let transport = Arc::new(LoopbackTransport {
        latency: Duration::from_millis(args.modem_latency_millis),
        sink: Mutex::new(None),
    });

    let engine = Arc::new(SatelliteEngine::new(Arc::new(config), EngineCollaborators {
        transport,
        gateway: Arc::new(RecordingGateway::new()),
        counter_store: Arc::new(InMemoryCounterStore::new()),
        datagram_store: Arc::new(InMemoryDatagramStore::new()),
        subscriptions: Arc::new(StaticSubscriptions::single(1)),
    })?);

    let (modem_listener, mut modem_states) = ChannelModemStateListener::new();
    engine.register_for_modem_state_changed(Arc::new(modem_listener)).await
        .map_err(|e| anyhow!("cannot register modem state listener: {}", e))?;
    tokio::spawn(async move {
        while let Some(state) = modem_states.recv().await {
            info!("modem state: {:?}", state);
        }
    });

    let mut transfer_events = engine.subscribe_transfer_events();
    tokio::spawn(async move {
        while let Ok(event) = transfer_events.recv().await {
            match event {
                TransferEvent::SendStateChanged(data) => debug!("send: {:?}", data.status),
                TransferEvent::ReceiveStateChanged(data) => debug!("receive: {:?}", data.status),
            }
        }
    });

    let (datagram_listener, mut received) = ChannelDatagramListener::new();
    engine.register_for_satellite_datagram(1, Arc::new(datagram_listener)).await
        .map_err(|e| anyhow!("cannot register datagram listener: {}", e))?;

    engine.on_satellite_enabled_state_changed(true);
    engine.set_demo_mode(true);

    for i in 0..args.count {
        engine.set_device_aligned_with_satellite(false);
        {
            let engine = engine.clone();
            let align_after = Duration::from_millis(args.align_after_millis);
            tokio::spawn(async move {
                time::sleep(align_after).await;
                info!("device aligned with satellite");
                engine.set_device_aligned_with_satellite(true);
            });
        }

        let payload = format!("{} #{}", args.message, i);
        info!("sending {:?}", payload);
        engine.send_satellite_datagram(1, DatagramType::Emergency, Datagram::new(payload), true).await
            .map_err(|e| anyhow!("sending failed: {}", e))?;
        info!("sent, waiting for the loopback");

        let timeout = Duration::from_secs(args.poll_delay_secs + 10);
        let Ok(Some(looped)) = time::timeout(timeout, received.recv()).await else {
            return Err(anyhow!("no datagram received within {:?}", timeout));
        };
        info!("received datagram {}: {:?}", looped.id, String::from_utf8_lossy(looped.datagram.payload()));
        looped.ack.acknowledge();
    }

    engine.set_demo_mode(false);
    engine.on_satellite_enabled_state_changed(false);
    engine.shutdown();
    Ok(())
}
