//! Cluster intake: single consumer of the discovery feed.
//!
//! Processes notifications strictly in arrival order. Upserts or deletes
//! instance-cache entries, constructs the per-cluster provider client,
//! resolves the event-hub resource group lazily, primes the per-region
//! VM-capability cache, and admits cluster ids into the work queue. On
//! cancellation or feed closure it requests queue shutdown and returns.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::collector::Shared;
use crate::provider::ProviderClient;
use crate::types::{Cluster, Instance, TagFilter, VmCapabilities};

pub(crate) struct ClusterIntake<C: ProviderClient> {
    shared: Arc<Shared<C>>,
    feed_rx: mpsc::Receiver<Cluster>,
    shutdown: watch::Receiver<bool>,
}

impl<C: ProviderClient> ClusterIntake<C> {
    pub(crate) fn new(
        shared: Arc<Shared<C>>,
        feed_rx: mpsc::Receiver<Cluster>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            feed_rx,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("cluster intake started");
        loop {
            tokio::select! {
                notification = self.feed_rx.recv() => match notification {
                    Some(cluster) => self.handle_notification(cluster).await,
                    None => {
                        info!("discovery feed closed, requesting queue shutdown");
                        self.shared.queue.shut_down();
                        return;
                    }
                },
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as cancellation too.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("cancellation requested, requesting queue shutdown");
                        self.shared.queue.shut_down();
                        return;
                    }
                }
            }
        }
    }

    /// Applies one feed notification.
    pub(crate) async fn handle_notification(&self, cluster: Cluster) {
        let id = cluster.technical_id.clone();
        debug!(
            cluster = %id,
            account = %cluster.account_id,
            subaccount = %cluster.sub_account_id,
            "received cluster notification"
        );

        // A delete tombstone makes any queued id inert: the worker observing
        // the missing entry drops it without requeuing.
        if cluster.deleted {
            info!(cluster = %id, "removing cluster from cache");
            self.shared.instances.delete(&id);
            return;
        }

        // Carry forward state that survives re-notification.
        let mut last_event = None;
        let mut event_hub_resource_group = None;
        if let Some(existing) = self.shared.instances.get(&id) {
            last_event = existing.last_event;
            event_hub_resource_group = existing.event_hub_resource_group;
        }

        let client = match (self.shared.builder)(&cluster) {
            Ok(client) => client,
            Err(e) => {
                error!(
                    cluster = %id,
                    error = %e,
                    "could not build provider client, cluster unmanaged until next notification"
                );
                self.shared.instances.delete(&id);
                return;
            }
        };

        if event_hub_resource_group.is_none() {
            let filter = TagFilter::sub_account(&cluster.sub_account_id);
            match client.get_resource_group(None, &filter).await {
                Ok(group) => event_hub_resource_group = Some(group.name),
                Err(e) => {
                    if !cluster.trial {
                        // The cluster may not be fully provisioned yet;
                        // re-deliver the same notification after one poll
                        // interval without blocking the intake loop.
                        let delay = self.shared.config.poll_interval;
                        warn!(
                            cluster = %id,
                            error = %e,
                            delay = ?delay,
                            "no event hub resource group yet, re-delivering notification"
                        );
                        let feed = self.shared.feed.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            // Upgrade only after the delay so the weak handle
                            // does not keep a closing feed open.
                            let sent = match feed.upgrade() {
                                Some(feed) => feed.send(cluster).await.is_ok(),
                                None => false,
                            };
                            if !sent {
                                debug!("feed closed, dropping re-delivered notification");
                            }
                        });
                        return;
                    }
                    debug!(cluster = %id, "trial cluster without event hub resource group");
                }
            }
        }

        let region = cluster.region.clone();
        let mut instance = Instance::new(cluster, client.clone());
        instance.last_event = last_event;
        instance.event_hub_resource_group = event_hub_resource_group;
        self.shared.instances.put(id.clone(), instance);

        if self.shared.vm_caps.get(&region).is_none() {
            debug!(cluster = %id, region = %region, "priming vm capability cache");
            match client.get_vm_resource_skus(&region).await {
                Ok(skus) => {
                    let mut caps = VmCapabilities::new();
                    for sku in skus {
                        let attrs: HashMap<String, String> = sku
                            .capabilities
                            .into_iter()
                            .map(|cap| (cap.name, cap.value))
                            .collect();
                        caps.insert(sku.name, attrs);
                    }
                    if caps.is_empty() {
                        debug!(region = %region, "empty vm capability catalog, not caching");
                    } else {
                        self.shared.vm_caps.put(region, caps);
                    }
                }
                Err(e) => {
                    warn!(
                        region = %region,
                        error = %e,
                        "could not fetch vm capabilities, some metrics won't be available"
                    );
                }
            }
        }

        self.shared.queue.add(id);
    }
}
