//! Pipeline wiring: stores, queue, intake task, and the worker pool.

use std::sync::Arc;

use futures::future::join_all;
use skymeter_queue::WorkQueue;
use skymeter_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::CollectorConfig;
use crate::intake::ClusterIntake;
use crate::provider::{ClientBuilder, ProviderClient};
use crate::types::{Cluster, ClusterId, Instance, UsageEvent, VmCapabilities};
use crate::worker::worker_loop;

/// State shared between the intake task and the workers.
///
/// The two stores are the only shared mutable state of the pipeline; the
/// work queue's per-key serialization keeps instance read-modify-write
/// sequences race free.
pub(crate) struct Shared<C: ProviderClient> {
    pub(crate) config: CollectorConfig,
    pub(crate) instances: Store<ClusterId, Instance<C>>,
    pub(crate) vm_caps: Store<String, VmCapabilities>,
    pub(crate) queue: WorkQueue<ClusterId>,
    pub(crate) builder: ClientBuilder<C>,
    pub(crate) events: mpsc::Sender<UsageEvent>,
    /// Weak sender side of the discovery feed, used for deferred
    /// re-deliveries. Weak so the feed still closes once every external
    /// handle is dropped.
    pub(crate) feed: mpsc::WeakSender<Cluster>,
}

/// The metering pipeline.
///
/// Owns the instance cache, the per-region VM-capability cache, and the
/// delaying work queue. [`Collector::run`] consumes the collector and drives
/// one intake task plus a fixed pool of polling workers until the discovery
/// feed closes or the shutdown signal fires. All state is in-memory; on
/// restart it is rebuilt from the discovery feed.
pub struct Collector<C: ProviderClient> {
    shared: Arc<Shared<C>>,
    feed_tx: mpsc::Sender<Cluster>,
    feed_rx: mpsc::Receiver<Cluster>,
}

impl<C: ProviderClient> Collector<C> {
    /// Creates a collector with the given provider constructor and event
    /// sink. The discovery feed channel is created internally; obtain sender
    /// handles with [`Collector::feed`] before calling [`Collector::run`].
    #[must_use]
    pub fn new(
        config: CollectorConfig,
        builder: ClientBuilder<C>,
        events: mpsc::Sender<UsageEvent>,
    ) -> Self {
        let (feed_tx, feed_rx) = mpsc::channel(config.feed_capacity);
        let shared = Arc::new(Shared {
            config,
            instances: Store::new("clusters"),
            vm_caps: Store::new("vm_capabilities"),
            queue: WorkQueue::new("clusters"),
            builder,
            events,
            feed: feed_tx.downgrade(),
        });
        Self {
            shared,
            feed_tx,
            feed_rx,
        }
    }

    /// A sender handle for the discovery feed. The pipeline stops once every
    /// handle has been dropped.
    #[must_use]
    pub fn feed(&self) -> mpsc::Sender<Cluster> {
        self.feed_tx.clone()
    }

    /// A handle to the instance cache (administrative browsing, tests).
    #[must_use]
    pub fn instances(&self) -> Store<ClusterId, Instance<C>> {
        self.shared.instances.clone()
    }

    /// A handle to the per-region VM-capability cache.
    #[must_use]
    pub fn vm_capabilities(&self) -> Store<String, VmCapabilities> {
        self.shared.vm_caps.clone()
    }

    /// Runs the pipeline until the feed closes or `shutdown` signals.
    ///
    /// Spawns the intake task and the configured number of workers, then
    /// waits for all of them. Workers drain naturally once the intake
    /// requests queue shutdown; in-flight cycles finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let Self {
            shared,
            feed_tx,
            feed_rx,
        } = self;
        // Only externally obtained feed handles keep the pipeline alive.
        drop(feed_tx);
        info!(workers = shared.config.workers, "collector started");

        let intake = ClusterIntake::new(Arc::clone(&shared), feed_rx, shutdown);
        let mut tasks = vec![tokio::spawn(intake.run())];
        for worker in 0..shared.config.workers {
            tasks.push(tokio::spawn(worker_loop(Arc::clone(&shared), worker)));
        }

        let _ = join_all(tasks).await;
        info!("collector stopped");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::provider::ScriptedClient;

    /// Builds a `Shared` directly for intake/worker unit tests, returning
    /// both ends of the feed channel and the event receiver so sends do not
    /// fail.
    pub(crate) fn shared_with(
        client: &ScriptedClient,
        config: CollectorConfig,
    ) -> (
        Arc<Shared<ScriptedClient>>,
        mpsc::Receiver<UsageEvent>,
        mpsc::Sender<Cluster>,
        mpsc::Receiver<Cluster>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (feed_tx, feed_rx) = mpsc::channel(config.feed_capacity);
        let shared = Arc::new(Shared {
            config,
            instances: Store::new("clusters"),
            vm_caps: Store::new("vm_capabilities"),
            queue: WorkQueue::new("clusters"),
            builder: client.builder(),
            events: events_tx,
            feed: feed_tx.downgrade(),
        });
        (shared, events_rx, feed_tx, feed_rx)
    }
}
