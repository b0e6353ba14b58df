//! Configuration surface of the metering pipeline.

use std::time::Duration;

/// Tunables for the collector.
///
/// The poll interval doubles as the steady-state cadence (workers re-admit
/// every cluster with this delay after each cycle) and as the deferred
/// re-delivery delay used by the intake when an event-hub resource group is
/// not resolvable yet.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Number of parallel workers draining the work queue.
    pub workers: usize,
    /// Steady-state polling cadence per cluster.
    pub poll_interval: Duration,
    /// Deadline for one cycle's whole metrics fetch.
    pub fetch_timeout: Duration,
    /// Own-resource-group-not-found observations before a cluster is
    /// presumed gone and removed.
    pub max_retry_attempts: u32,
    /// Capacity of the discovery feed channel.
    pub feed_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(120),
            max_retry_attempts: 5,
            feed_capacity: 64,
        }
    }
}
