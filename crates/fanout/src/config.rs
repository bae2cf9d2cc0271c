//! Engine tunables.

use std::time::Duration;

/// Configurable options for the scheduler loop and its workers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of destination workers alive at once.
    pub pool_size: usize,

    /// Delay between scheduler loop iterations.
    pub tick: Duration,

    /// Delay between worker step iterations when nothing is ready.
    pub step_delay: Duration,

    /// How far ahead of a transfer's scheduled time the loop will look when
    /// deciding whether a destination has pending work.
    pub look_ahead: Duration,

    /// A worker with an empty queue shuts itself down after this long.
    pub inactivity_timeout: Duration,

    /// Graceful-drain budget applied when a configuration change forces a
    /// worker restart.
    pub dirty_shutdown_timeout: Duration,

    /// How long a non-green monitor color is held before the destination may
    /// report green again.
    pub monitor_hold: Duration,

    /// Delay between monitoring samples.
    pub monitor_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 400,
            tick: Duration::from_secs(2),
            step_delay: Duration::from_secs(2),
            look_ahead: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(5 * 60),
            dirty_shutdown_timeout: Duration::from_secs(60 * 60),
            monitor_hold: Duration::from_secs(10 * 60),
            monitor_tick: Duration::from_secs(30),
        }
    }
}
