//! Interface to the host audio subsystem.

/// Direction of a host PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDirection {
    /// Host to device.
    Playback,
    /// Device to host; not served by this driver.
    Capture,
}

/// Commands the host issues through `trigger`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Begin consuming the ring buffer.
    Start,
    /// Stop consuming the ring buffer.
    Stop,
    /// Pause; behaves like `Stop`.
    PausePush,
    /// Resume from pause; behaves like `Start`.
    PauseRelease,
    /// System suspend.
    Suspend,
    /// System resume.
    Resume,
}

/// Callbacks the driver makes into the host for an open stream.
///
/// `period_elapsed` runs on the completion worker and must not block on the
/// driver's control operations.
pub trait HostPcm: Send + Sync {
    /// One more period of the ring buffer has been consumed.
    fn period_elapsed(&self);

    /// The device is gone; the host should move the stream to the xrun state.
    fn stop_xrun(&self);
}
