pub mod client;
pub mod frame;
pub mod registry;
pub mod server;

use std::time::Duration;

/// Deadline renewed around every tunnel/upstream read so loops observe
/// cancellation (and tunnel supersession) within one interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
