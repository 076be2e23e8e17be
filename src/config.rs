use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::datagram::SubscriptionId;

#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// determines the session's initial state and whether datagram listeners may register
    pub satellite_supported: bool,

    /// demo mode: how long a completed send or poll waits for the device to be aligned with
    ///  the satellite before it fails as 'not reachable'
    pub align_timeout: Duration,
    /// redelivery interval for received datagrams that a listener did not acknowledge
    pub ack_timeout: Duration,

    pub stay_at_listening_from_sending: Duration,
    pub stay_at_listening_from_receiving: Duration,
    pub demo_stay_at_listening: Duration,

    /// a send request that the modem does not answer within this period fails as timed out
    pub send_response_timeout: Duration,
    /// demo mode: delay between a successful emergency send and the simulated poll that loops
    ///  it back
    pub demo_poll_delay: Duration,

    pub wait_for_alignment_in_demo_mode: bool,
    /// runtime timeout overrides are refused unless this is set (test / diagnostic builds)
    pub allow_test_overrides: bool,
}

impl SatelliteConfig {
    pub fn new() -> SatelliteConfig {
        SatelliteConfig {
            satellite_supported: true,
            align_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(5 * 60),
            stay_at_listening_from_sending: Duration::from_secs(180),
            stay_at_listening_from_receiving: Duration::from_secs(30),
            demo_stay_at_listening: Duration::from_secs(3),
            send_response_timeout: Duration::from_secs(180),
            demo_poll_delay: Duration::from_secs(10),
            wait_for_alignment_in_demo_mode: true,
            allow_test_overrides: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.send_response_timeout.is_zero() {
            bail!("send response timeout must be positive");
        }
        if self.stay_at_listening_from_sending.is_zero() || self.stay_at_listening_from_receiving.is_zero() || self.demo_stay_at_listening.is_zero() {
            bail!("listening timeouts must be positive");
        }
        if self.wait_for_alignment_in_demo_mode && self.align_timeout.is_zero() {
            bail!("alignment timeout must be positive when waiting for alignment");
        }
        Ok(())
    }
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        SatelliteConfig::new()
    }
}

/// Maps a caller-supplied subscription id to the one the engine actually uses.
pub trait SubscriptionValidator: Send + Sync + 'static {
    fn validated_subscription_id(&self, subscription_id: SubscriptionId) -> SubscriptionId;

    /// the subscription reported for status changes that are not tied to a request
    fn default_subscription_id(&self) -> SubscriptionId;
}

/// A fixed set of active subscriptions: active ids map to themselves, everything else to the
///  default.
#[derive(Debug, Clone)]
pub struct StaticSubscriptions {
    active: FxHashSet<SubscriptionId>,
    default_id: SubscriptionId,
}

impl StaticSubscriptions {
    pub fn new(active: impl IntoIterator<Item=SubscriptionId>, default_id: SubscriptionId) -> StaticSubscriptions {
        StaticSubscriptions {
            active: active.into_iter().collect(),
            default_id,
        }
    }

    pub fn single(default_id: SubscriptionId) -> StaticSubscriptions {
        StaticSubscriptions::new([default_id], default_id)
    }
}

impl SubscriptionValidator for StaticSubscriptions {
    fn validated_subscription_id(&self, subscription_id: SubscriptionId) -> SubscriptionId {
        if self.active.contains(&subscription_id) {
            subscription_id
        }
        else {
            self.default_id
        }
    }

    fn default_subscription_id(&self) -> SubscriptionId {
        self.default_id
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SatelliteConfig::new().validate().is_ok());
    }

    #[rstest]
    #[case::zero_ack(|c: &mut SatelliteConfig| c.ack_timeout = Duration::ZERO)]
    #[case::zero_send_response(|c: &mut SatelliteConfig| c.send_response_timeout = Duration::ZERO)]
    #[case::zero_listening(|c: &mut SatelliteConfig| c.stay_at_listening_from_receiving = Duration::ZERO)]
    #[case::zero_demo_listening(|c: &mut SatelliteConfig| c.demo_stay_at_listening = Duration::ZERO)]
    #[case::zero_alignment(|c: &mut SatelliteConfig| c.align_timeout = Duration::ZERO)]
    fn test_invalid_config(#[case] modify: fn(&mut SatelliteConfig)) {
        let mut config = SatelliteConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_alignment_allowed_without_waiting() {
        let mut config = SatelliteConfig::new();
        config.align_timeout = Duration::ZERO;
        config.wait_for_alignment_in_demo_mode = false;
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 1)]
    #[case(-1, 1)]
    fn test_static_subscriptions(#[case] requested: SubscriptionId, #[case] expected: SubscriptionId) {
        let subscriptions = StaticSubscriptions::new([1, 2], 1);
        assert_eq!(subscriptions.validated_subscription_id(requested), expected);
        assert_eq!(subscriptions.default_subscription_id(), 1);
    }
}
