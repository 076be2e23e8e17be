use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::info;

use crate::config::SatelliteConfig;
use crate::util::lock;

/// Everything that changes when the engine simulates the satellite link instead of using it
///  for real.
///
/// In demo mode, an emergency datagram that is sent is captured and later looped back as the
///  next received datagram, and completions of sends and polls are held back until the device
///  reports being aligned with the (simulated) satellite.
#[derive(Debug)]
pub struct DemoModeConfig {
    enabled: AtomicBool,
    wait_for_alignment: bool,
    configured_align_timeout: Duration,
    configured_poll_delay: Duration,
    align_timeout: Mutex<Duration>,
    poll_delay: Mutex<Duration>,
}

impl DemoModeConfig {
    pub fn new(config: &SatelliteConfig) -> DemoModeConfig {
        DemoModeConfig {
            enabled: AtomicBool::new(false),
            wait_for_alignment: config.wait_for_alignment_in_demo_mode,
            configured_align_timeout: config.align_timeout,
            configured_poll_delay: config.demo_poll_delay,
            align_timeout: Mutex::new(config.align_timeout),
            poll_delay: Mutex::new(config.demo_poll_delay),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.enabled.swap(enabled, Ordering::AcqRel);
        if was_enabled != enabled {
            info!("demo mode {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// whether a successful completion must be held until the device is aligned
    pub fn needs_alignment_wait(&self, is_aligned: bool) -> bool {
        self.is_enabled() && self.wait_for_alignment && !is_aligned
    }

    pub fn align_timeout(&self) -> Duration {
        *lock(&self.align_timeout)
    }

    pub fn override_align_timeout(&self, reset: bool, timeout: Duration) {
        *lock(&self.align_timeout) = if reset { self.configured_align_timeout } else { timeout };
    }

    pub fn poll_delay(&self) -> Duration {
        *lock(&self.poll_delay)
    }

    pub fn override_poll_delay(&self, reset: bool, delay: Duration) {
        *lock(&self.poll_delay) = if reset { self.configured_poll_delay } else { delay };
    }
}

/// Completions held back until the device is aligned with the satellite, at most one per key.
///  The owning actor runs the alignment timeout; the gate only keeps the held values.
#[derive(Debug)]
pub struct AlignmentGate<K, R> {
    held: FxHashMap<K, R>,
}

impl<K: Eq + Hash + Copy, R> AlignmentGate<K, R> {
    pub fn new() -> AlignmentGate<K, R> {
        AlignmentGate {
            held: Default::default(),
        }
    }

    /// returns a previously held value for the same key, which the caller must resolve
    pub fn hold(&mut self, key: K, value: R) -> Option<R> {
        self.held.insert(key, value)
    }

    pub fn release(&mut self, key: K) -> Option<R> {
        self.held.remove(&key)
    }

    pub fn release_all(&mut self) -> Vec<(K, R)> {
        self.held.drain().collect()
    }

    pub fn is_waiting(&self, key: K) -> bool {
        self.held.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<K: Eq + Hash + Copy, R> Default for AlignmentGate<K, R> {
    fn default() -> Self {
        AlignmentGate::new()
    }
}
