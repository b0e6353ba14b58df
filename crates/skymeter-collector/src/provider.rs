//! Provider client capability interface and the constructor table.
//!
//! The pipeline is generic over a [`ProviderClient`]: a cheap-to-clone handle
//! exposing the five provider capabilities the collector needs. Concrete
//! providers live elsewhere; [`ScriptedClient`] is an in-memory double for
//! tests and examples.
//!
//! Provider constructors are supplied at startup through an explicit
//! [`ProviderRegistry`] rather than any self-registration side effect.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CollectorError, ProviderError};
use crate::types::{
    Cluster, ComputeUsage, EventHubUsage, NetworkUsage, ResourceGroup, TagFilter, VmCapabilities,
    VmSku, VmSkuCapability, VmType, VolumeUsage,
};

/// Capability interface over the cloud provider API.
///
/// Handles are cheap to clone (implementations wrap shared state in an
/// `Arc`); every method returns a `Send` future so workers can run on the
/// multi-threaded runtime. Errors carry the HTTP-like classification the
/// retry policy branches on, see [`ProviderError`].
pub trait ProviderClient: Clone + Send + Sync + 'static {
    /// Looks up a resource group by tag, optionally restricted to a region.
    fn get_resource_group(
        &self,
        region: Option<&str>,
        filter: &TagFilter,
    ) -> impl Future<Output = Result<ResourceGroup, ProviderError>> + Send;

    /// Lists the VM SKU/capability catalog for a region.
    fn get_vm_resource_skus(
        &self,
        region: &str,
    ) -> impl Future<Output = Result<Vec<VmSku>, ProviderError>> + Send;

    /// Fetches compute usage, interpreted through the region's capability
    /// catalog.
    fn fetch_compute(
        &self,
        vm_caps: &VmCapabilities,
    ) -> impl Future<Output = Result<ComputeUsage, ProviderError>> + Send;

    /// Fetches network usage.
    fn fetch_network(&self) -> impl Future<Output = Result<NetworkUsage, ProviderError>> + Send;

    /// Fetches event-hub usage over the given polling grain.
    fn fetch_event_hub(
        &self,
        poll_interval: Duration,
    ) -> impl Future<Output = Result<EventHubUsage, ProviderError>> + Send;
}

/// Per-cluster client constructor.
///
/// Construction is synchronous (it assembles credentials and endpoints, it
/// does not talk to the network); failure drops the cluster until the next
/// feed notification.
pub type ClientBuilder<C> = Arc<dyn Fn(&Cluster) -> Result<C, CollectorError> + Send + Sync>;

/// Statically built table of provider constructors, supplied at startup.
///
/// Replaces runtime self-registration: the embedding binary builds the table
/// once, then resolves the configured provider name to a [`ClientBuilder`].
pub struct ProviderRegistry<C> {
    builders: HashMap<&'static str, ClientBuilder<C>>,
}

impl<C> Default for ProviderRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ProviderRegistry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers a provider constructor under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::DuplicateProvider`] if `name` is taken.
    pub fn register(
        &mut self,
        name: &'static str,
        builder: ClientBuilder<C>,
    ) -> Result<(), CollectorError> {
        if self.builders.contains_key(name) {
            return Err(CollectorError::DuplicateProvider {
                name: name.to_string(),
            });
        }
        self.builders.insert(name, builder);
        Ok(())
    }

    /// Resolves the constructor registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::UnknownProvider`] if nothing is registered.
    pub fn builder(&self, name: &str) -> Result<ClientBuilder<C>, CollectorError> {
        self.builders
            .get(name)
            .cloned()
            .ok_or_else(|| CollectorError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Registered provider names, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }
}

/// Scriptable in-memory [`ProviderClient`] double.
///
/// All clones share one script, so a test can keep a handle and reprogram
/// responses while the pipeline runs. Fetch outcomes are consumed from a
/// per-cycle plan first, then fall back to a persistent outcome (success by
/// default). Call counters allow asserting how many cycles actually reached
/// the provider.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    state: Arc<ScriptState>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient").finish_non_exhaustive()
    }
}

struct ScriptState {
    resource_group: Mutex<Result<ResourceGroup, ProviderError>>,
    skus: Mutex<Result<Vec<VmSku>, ProviderError>>,
    fetch_plan: Mutex<VecDeque<Result<(), ProviderError>>>,
    persistent_failure: Mutex<Option<ProviderError>>,
    network_failure: Mutex<Option<ProviderError>>,
    event_hub_failure: Mutex<Option<ProviderError>>,
    fetch_latency: Mutex<Duration>,
    fetch_calls: AtomicUsize,
    resource_group_calls: AtomicUsize,
    sku_calls: AtomicUsize,
    active_fetches: AtomicUsize,
    overlapped: AtomicBool,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            resource_group: Mutex::new(Ok(ResourceGroup {
                name: "eventhub-rg".to_string(),
            })),
            skus: Mutex::new(Ok(vec![VmSku {
                name: "standard_d8_v3".to_string(),
                capabilities: vec![
                    VmSkuCapability {
                        name: "vCPUs".to_string(),
                        value: "8".to_string(),
                    },
                    VmSkuCapability {
                        name: "MemoryGB".to_string(),
                        value: "32".to_string(),
                    },
                ],
            }])),
            fetch_plan: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            network_failure: Mutex::new(None),
            event_hub_failure: Mutex::new(None),
            fetch_latency: Mutex::new(Duration::ZERO),
            fetch_calls: AtomicUsize::new(0),
            resource_group_calls: AtomicUsize::new(0),
            sku_calls: AtomicUsize::new(0),
            active_fetches: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        }
    }
}

impl ScriptedClient {
    /// A [`ClientBuilder`] handing out clones of this client.
    #[must_use]
    pub fn builder(&self) -> ClientBuilder<Self> {
        let client = self.clone();
        Arc::new(move |_| Ok(client.clone()))
    }

    /// A [`ClientBuilder`] that always fails construction.
    #[must_use]
    pub fn failing_builder(reason: &str) -> ClientBuilder<Self> {
        let reason = reason.to_string();
        Arc::new(move |_| {
            Err(CollectorError::ClientConstruction {
                reason: reason.clone(),
            })
        })
    }

    /// Scripts the resource-group lookup outcome.
    pub fn set_resource_group(&self, result: Result<ResourceGroup, ProviderError>) {
        *self.state.resource_group.lock() = result;
    }

    /// Scripts the SKU catalog outcome.
    pub fn set_skus(&self, result: Result<Vec<VmSku>, ProviderError>) {
        *self.state.skus.lock() = result;
    }

    /// Appends per-cycle fetch outcomes, consumed in order before the
    /// persistent outcome applies.
    pub fn script_fetches(&self, outcomes: impl IntoIterator<Item = Result<(), ProviderError>>) {
        self.state.fetch_plan.lock().extend(outcomes);
    }

    /// Makes every unscripted fetch fail with `error`.
    pub fn fail_fetches(&self, error: ProviderError) {
        *self.state.persistent_failure.lock() = Some(error);
    }

    /// Restores the default succeed-by-default fetch behavior.
    pub fn clear_failures(&self) {
        *self.state.persistent_failure.lock() = None;
        *self.state.network_failure.lock() = None;
        *self.state.event_hub_failure.lock() = None;
    }

    /// Makes the network sub-fetch fail with `error`.
    pub fn fail_network(&self, error: ProviderError) {
        *self.state.network_failure.lock() = Some(error);
    }

    /// Makes the event-hub sub-fetch fail with `error`.
    pub fn fail_event_hub(&self, error: ProviderError) {
        *self.state.event_hub_failure.lock() = Some(error);
    }

    /// Adds artificial latency to each compute fetch.
    pub fn set_fetch_latency(&self, latency: Duration) {
        *self.state.fetch_latency.lock() = latency;
    }

    /// Number of fetch cycles that reached the provider.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of resource-group lookups.
    #[must_use]
    pub fn resource_group_calls(&self) -> usize {
        self.state.resource_group_calls.load(Ordering::SeqCst)
    }

    /// Number of SKU catalog listings.
    #[must_use]
    pub fn sku_calls(&self) -> usize {
        self.state.sku_calls.load(Ordering::SeqCst)
    }

    /// Whether two fetches were ever observed running at the same time.
    #[must_use]
    pub fn overlapped(&self) -> bool {
        self.state.overlapped.load(Ordering::SeqCst)
    }

    fn next_fetch_outcome(&self) -> Result<(), ProviderError> {
        let planned = self.state.fetch_plan.lock().pop_front();
        planned.unwrap_or_else(|| match self.state.persistent_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        })
    }
}

impl ProviderClient for ScriptedClient {
    fn get_resource_group(
        &self,
        _region: Option<&str>,
        _filter: &TagFilter,
    ) -> impl Future<Output = Result<ResourceGroup, ProviderError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.resource_group_calls.fetch_add(1, Ordering::SeqCst);
            state.resource_group.lock().clone()
        }
    }

    fn get_vm_resource_skus(
        &self,
        _region: &str,
    ) -> impl Future<Output = Result<Vec<VmSku>, ProviderError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.sku_calls.fetch_add(1, Ordering::SeqCst);
            state.skus.lock().clone()
        }
    }

    fn fetch_compute(
        &self,
        vm_caps: &VmCapabilities,
    ) -> impl Future<Output = Result<ComputeUsage, ProviderError>> + Send {
        let client = self.clone();
        let caps_known = !vm_caps.is_empty();
        async move {
            let state = &client.state;
            state.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if state.active_fetches.fetch_add(1, Ordering::SeqCst) > 0 {
                state.overlapped.store(true, Ordering::SeqCst);
            }
            let latency = *state.fetch_latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            state.active_fetches.fetch_sub(1, Ordering::SeqCst);

            client.next_fetch_outcome()?;
            Ok(ComputeUsage {
                vm_types: vec![VmType {
                    name: "standard_d8_v3".to_string(),
                    count: 3,
                }],
                provisioned_cpus: 24,
                provisioned_ram_gb: if caps_known { 96.0 } else { 0.0 },
                provisioned_volumes: VolumeUsage {
                    size_gb_total: 150,
                    count: 3,
                    size_gb_rounded: 192,
                },
            })
        }
    }

    fn fetch_network(&self) -> impl Future<Output = Result<NetworkUsage, ProviderError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            if let Some(error) = state.network_failure.lock().clone() {
                return Err(error);
            }
            Ok(NetworkUsage {
                provisioned_vnets: 1,
                provisioned_ips: 3,
                provisioned_loadbalancers: 1,
            })
        }
    }

    fn fetch_event_hub(
        &self,
        _poll_interval: Duration,
    ) -> impl Future<Output = Result<EventHubUsage, ProviderError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            if let Some(error) = state.event_hub_failure.lock().clone() {
                return Err(error);
            }
            Ok(EventHubUsage {
                number_namespaces: 1,
                incoming_requests_pt1m: 120,
                max_incoming_bytes_pt1m: 4096,
                max_outgoing_bytes_pt1m: 2048,
                incoming_requests_pt5m: 600,
                max_incoming_bytes_pt5m: 20480,
                max_outgoing_bytes_pt5m: 10240,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClusterId;

    fn sample_cluster() -> Cluster {
        Cluster {
            technical_id: ClusterId::from("c1"),
            account_id: "acc".to_string(),
            sub_account_id: "sub".to_string(),
            region: "eu1".to_string(),
            trial: false,
            deleted: false,
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn register_and_resolve() {
            let client = ScriptedClient::default();
            let mut registry = ProviderRegistry::new();
            registry.register("az", client.builder()).unwrap();

            let builder = registry.builder("az").unwrap();
            assert!(builder(&sample_cluster()).is_ok());
            assert_eq!(registry.names(), vec!["az"]);
        }

        #[test]
        fn duplicate_registration_is_rejected() {
            let client = ScriptedClient::default();
            let mut registry = ProviderRegistry::new();
            registry.register("az", client.builder()).unwrap();

            let err = registry.register("az", client.builder()).unwrap_err();
            assert!(matches!(err, CollectorError::DuplicateProvider { .. }));
        }

        #[test]
        fn unknown_provider_is_an_error() {
            let registry: ProviderRegistry<ScriptedClient> = ProviderRegistry::new();
            let err = registry.builder("gcp").err().unwrap();
            assert!(matches!(err, CollectorError::UnknownProvider { .. }));
        }
    }

    mod scripted_client_tests {
        use super::*;

        #[tokio::test]
        async fn default_fetches_succeed() {
            let client = ScriptedClient::default();
            let caps = VmCapabilities::new();

            let compute = client.fetch_compute(&caps).await.unwrap();
            assert_eq!(compute.provisioned_cpus, 24);
            assert_eq!(client.fetch_calls(), 1);

            assert!(client.fetch_network().await.is_ok());
            assert!(client.fetch_event_hub(Duration::from_secs(60)).await.is_ok());
        }

        #[tokio::test]
        async fn scripted_outcomes_are_consumed_in_order() {
            let client = ScriptedClient::default();
            client.script_fetches([Err(ProviderError::RateLimited), Ok(())]);
            let caps = VmCapabilities::new();

            assert_eq!(
                client.fetch_compute(&caps).await.unwrap_err(),
                ProviderError::RateLimited
            );
            assert!(client.fetch_compute(&caps).await.is_ok());
        }

        #[tokio::test]
        async fn persistent_failure_applies_after_plan() {
            let client = ScriptedClient::default();
            client.fail_fetches(ProviderError::Request {
                reason: "boom".to_string(),
                status: Some(500),
            });
            let caps = VmCapabilities::new();

            assert!(client.fetch_compute(&caps).await.is_err());
            assert!(client.fetch_compute(&caps).await.is_err());

            client.clear_failures();
            assert!(client.fetch_compute(&caps).await.is_ok());
        }

        #[tokio::test]
        async fn failing_builder_fails_construction() {
            let builder = ScriptedClient::failing_builder("no credentials");
            let err = builder(&sample_cluster()).unwrap_err();
            assert!(matches!(err, CollectorError::ClientConstruction { .. }));
        }
    }
}
