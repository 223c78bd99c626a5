//! Developer tooling: a simulated device session and a console to drive it.

/// Status queries and actions on registered devices.
pub mod api;
/// Simulated device playing a test tone through the full driver.
pub mod session;
/// Host stream that renders a sine into the ring buffer.
pub mod tone;
/// Ratatui-based developer console.
pub mod ui;
