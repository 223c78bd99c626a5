//! Driver tunables.

use std::time::Duration;

use crate::rate::RatePolicy;

/// How the DMA area handed to the host is backed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DmaBacking {
    /// Plain heap allocation.
    #[default]
    Local,
    /// Anonymous shared mapping that can be exported to another process.
    Shared,
}

/// Timing and policy knobs for one driver instance.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// How long `start` waits for the first transfer to come back.
    pub start_timeout: Duration,
    /// Per-buffer wait for in-flight transfers to drain before cancelling them.
    pub drain_timeout: Duration,
    /// Timeout of the rate control request.
    pub control_timeout: Duration,
    /// Whether a rate request for the active rate is sent again.
    pub rate_policy: RatePolicy,
    /// Number of devices the registry will serve at once.
    pub max_devices: usize,
    /// Backing store for DMA areas allocated in `hw_params`.
    pub dma_backing: DmaBacking,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(100),
            control_timeout: Duration::from_millis(100),
            rate_policy: RatePolicy::SkipUnchanged,
            max_devices: 8,
            dma_backing: DmaBacking::Local,
        }
    }
}

impl DriverConfig {
    /// Override the start handshake timeout.
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Override the per-buffer drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Override the redundant rate request policy.
    pub fn with_rate_policy(mut self, policy: RatePolicy) -> Self {
        self.rate_policy = policy;
        self
    }

    /// Override the registry size.
    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Override the DMA backing store.
    pub fn with_dma_backing(mut self, backing: DmaBacking) -> Self {
        self.dma_backing = backing;
        self
    }
}
