//! Polling workers: the consumer side of the work queue.
//!
//! Each worker loops on [`WorkQueue::get`], runs one metering cycle for the
//! claimed cluster, marks it done, and re-admits it after the poll interval.
//! The queue guarantees at most one worker per cluster id, so a cycle may
//! read-modify-write its instance entry without further locking.
//!
//! [`WorkQueue::get`]: skymeter_queue::WorkQueue::get

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::collector::Shared;
use crate::config::CollectorConfig;
use crate::error::ProviderError;
use crate::provider::ProviderClient;
use crate::types::{ClusterId, EventData, EventHubUsage, Instance, UsageEvent, VmCapabilities};

pub(crate) async fn worker_loop<C: ProviderClient>(shared: Arc<Shared<C>>, worker: usize) {
    debug!(worker, "worker started");
    while let Some(id) = shared.queue.get().await {
        let requeue = run_cycle(&shared, worker, &id).await;
        shared.queue.done(&id);
        if requeue && !shared.queue.shutting_down() {
            shared.queue.add_after(id, shared.config.poll_interval);
        }
    }
    debug!(worker, "worker stopped");
}

/// Runs one metering cycle for `id`. Returns whether the cluster should be
/// re-admitted for another cycle.
pub(crate) async fn run_cycle<C: ProviderClient>(
    shared: &Arc<Shared<C>>,
    worker: usize,
    id: &ClusterId,
) -> bool {
    let Some(mut instance) = shared.instances.get(id) else {
        // Deleted between admission and claim; the id dies here.
        debug!(worker, cluster = %id, "no cache entry for claimed cluster, dropping");
        return false;
    };

    // A snapshot stored under the wrong key cannot be metered faithfully.
    if instance.cluster.technical_id != *id {
        error!(
            worker,
            cluster = %id,
            entry = %instance.cluster.technical_id,
            "cache entry does not match its key, removing"
        );
        shared.instances.delete(id);
        return false;
    }

    let vm_caps = shared.vm_caps.get(&instance.cluster.region).unwrap_or_else(|| {
        warn!(
            worker,
            cluster = %id,
            region = %instance.cluster.region,
            "no vm capabilities cached for region, some metrics won't be available"
        );
        VmCapabilities::new()
    });

    let outcome = if instance.retry_backoff {
        // One-shot: the flag is consumed whether or not throttling persists.
        instance.retry_backoff = false;
        Err(ProviderError::SelfThrottle)
    } else {
        fetch_usage(&instance, &vm_caps, &shared.config).await
    };

    let mut removed = false;
    let (data, fresh) = match outcome {
        Ok(data) => {
            instance.retry_attempts = 0;
            (Some(data), true)
        }
        Err(error) => {
            match &error {
                ProviderError::ResourceGroupNotFound { name } if name == id.as_str() => {
                    instance.retry_attempts += 1;
                    if instance.retry_attempts >= shared.config.max_retry_attempts {
                        info!(
                            worker,
                            cluster = %id,
                            attempts = instance.retry_attempts,
                            "cluster resource group gone, removing cluster from cache"
                        );
                        shared.instances.delete(id);
                        removed = true;
                    } else {
                        warn!(
                            worker,
                            cluster = %id,
                            attempts = instance.retry_attempts,
                            max = shared.config.max_retry_attempts,
                            "cluster resource group not found, retaining for retry"
                        );
                    }
                }
                ProviderError::RateLimited => {
                    warn!(worker, cluster = %id, "provider is throttling, skipping next fetch");
                    instance.retry_backoff = true;
                }
                _ => {
                    warn!(worker, cluster = %id, error = %error, "metrics fetch failed");
                }
            }
            if removed {
                (None, false)
            } else {
                (instance.last_event.clone(), false)
            }
        }
    };

    if let Some(data) = data {
        send_event(shared, worker, &mut instance, data, fresh).await;
    } else if !removed {
        debug!(worker, cluster = %id, "no event to send, no previous event cached");
    }

    if !removed {
        shared.instances.put(id.clone(), instance);
    }
    !removed
}

/// Fetches one cycle's usage aggregate under the cycle deadline.
///
/// Sub-fetches run sequentially and fail fast; the event-hub fetch is skipped
/// (zeroed usage) when no event-hub resource group is known.
async fn fetch_usage<C: ProviderClient>(
    instance: &Instance<C>,
    vm_caps: &VmCapabilities,
    config: &CollectorConfig,
) -> Result<EventData, ProviderError> {
    let fetch = async {
        let compute = instance.client.fetch_compute(vm_caps).await?;
        let networking = instance.client.fetch_network().await?;
        let event_hub = match &instance.event_hub_resource_group {
            Some(_) => instance.client.fetch_event_hub(config.poll_interval).await?,
            None => EventHubUsage::default(),
        };

        let mut resource_groups = vec![instance.cluster.technical_id.to_string()];
        if let Some(group) = &instance.event_hub_resource_group {
            resource_groups.push(group.clone());
        }
        Ok(EventData {
            resource_groups,
            compute,
            networking,
            event_hub,
        })
    };

    match timeout(config.fetch_timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            limit: config.fetch_timeout,
        }),
    }
}

/// Serializes `data` and hands it to the event sink.
///
/// A fresh aggregate becomes the instance's cached fallback only once it has
/// serialized; re-sent fallbacks never refresh the cache. Serialization
/// failures drop the event, sink closure is logged and tolerated.
async fn send_event<C: ProviderClient>(
    shared: &Arc<Shared<C>>,
    worker: usize,
    instance: &mut Instance<C>,
    data: EventData,
    fresh: bool,
) {
    let id = &instance.cluster.technical_id;
    let payload = match serde_json::to_value(&data) {
        Ok(payload) => payload,
        Err(error) => {
            error!(worker, cluster = %id, error = %error, "could not serialize usage event");
            return;
        }
    };
    if fresh {
        instance.last_event = Some(data);
    }

    let event = UsageEvent {
        data_tenant: instance.cluster.sub_account_id.clone(),
        payload,
    };
    if shared.events.send(event).await.is_err() {
        warn!(worker, cluster = %id, "event sink closed, dropping usage event");
    } else {
        debug!(worker, cluster = %id, fresh, "usage event sent");
    }
}
