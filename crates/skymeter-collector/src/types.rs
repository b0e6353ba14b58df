//! Data model for the metering pipeline.
//!
//! Cluster snapshots arrive on the discovery feed, per-cluster state lives in
//! [`Instance`] entries inside the instance cache, and each successful polling
//! cycle produces an [`EventData`] aggregate that is serialized into a
//! [`UsageEvent`] for the downstream sink.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag name carrying the subaccount id on event-hub resource groups.
pub const TAG_SUB_ACCOUNT_ID: &str = "SubAccountID";

/// Unique identifier of a managed cluster (the discovery feed's TechnicalID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Creates a cluster id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Immutable cluster snapshot delivered by the discovery feed.
///
/// Delivery is at-least-once; the intake consumer is idempotent via
/// upsert/delete semantics keyed on [`Cluster::technical_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster key.
    pub technical_id: ClusterId,
    /// Owning account.
    pub account_id: String,
    /// Owning subaccount; tags the emitted usage events.
    pub sub_account_id: String,
    /// Provider region the cluster runs in.
    pub region: String,
    /// Trial clusters tolerate a permanently absent event-hub resource group.
    pub trial: bool,
    /// Set when the cluster has been deprovisioned.
    pub deleted: bool,
}

/// Per-region VM capability catalog: vm type → capability name → value.
///
/// Populated once per region on first sighting and never invalidated for the
/// process lifetime.
pub type VmCapabilities = HashMap<String, HashMap<String, String>>;

/// A VM SKU as listed by the provider, folded into [`VmCapabilities`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSku {
    /// SKU name (vm type).
    pub name: String,
    /// Capability attributes of this SKU.
    pub capabilities: Vec<VmSkuCapability>,
}

/// A single capability attribute of a VM SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSkuCapability {
    /// Capability name (e.g. `vCPUs`).
    pub name: String,
    /// Capability value, as reported by the provider.
    pub value: String,
}

/// A provider resource group, resolved by tag lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Resource group name.
    pub name: String,
}

/// Tag name/value pair used for resource-group lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    /// Tag name to match.
    pub name: String,
    /// Required tag value.
    pub value: String,
}

impl TagFilter {
    /// Creates an arbitrary tag filter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Filter matching the event-hub resource group of a subaccount.
    #[must_use]
    pub fn sub_account(id: &str) -> Self {
        Self::new(TAG_SUB_ACCOUNT_ID, id)
    }
}

/// Count of provisioned machines of one VM type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmType {
    /// VM type name.
    pub name: String,
    /// Number of provisioned machines.
    pub count: u32,
}

/// Provisioned volume totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    /// Sum of provisioned volume sizes in GB.
    pub size_gb_total: u32,
    /// Number of provisioned volumes.
    pub count: u32,
    /// Sum of volume sizes rounded up to the billing granularity.
    pub size_gb_rounded: u32,
}

/// Compute usage for one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeUsage {
    /// Provisioned machines grouped by VM type.
    pub vm_types: Vec<VmType>,
    /// Total provisioned vCPUs.
    pub provisioned_cpus: u32,
    /// Total provisioned RAM in GB, derived from the VM capability catalog.
    pub provisioned_ram_gb: f64,
    /// Provisioned volume totals.
    pub provisioned_volumes: VolumeUsage,
}

/// Network usage for one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkUsage {
    /// Number of provisioned virtual networks.
    pub provisioned_vnets: u32,
    /// Number of provisioned public IPs.
    pub provisioned_ips: u32,
    /// Number of provisioned load balancers.
    pub provisioned_loadbalancers: u32,
}

/// Managed-messaging (event hub) usage for one polling cycle.
///
/// Zeroed when the cluster has no known event-hub resource group (trial
/// clusters may never have one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHubUsage {
    /// Number of event-hub namespaces.
    pub number_namespaces: u32,
    /// Incoming requests over the last 1-minute grain.
    pub incoming_requests_pt1m: u64,
    /// Peak incoming bytes over the last 1-minute grain.
    pub max_incoming_bytes_pt1m: u64,
    /// Peak outgoing bytes over the last 1-minute grain.
    pub max_outgoing_bytes_pt1m: u64,
    /// Incoming requests over the last 5-minute grain.
    pub incoming_requests_pt5m: u64,
    /// Peak incoming bytes over the last 5-minute grain.
    pub max_incoming_bytes_pt5m: u64,
    /// Peak outgoing bytes over the last 5-minute grain.
    pub max_outgoing_bytes_pt5m: u64,
}

/// Usage aggregate computed by one successful polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Resource groups the metrics were collected from (the cluster's own
    /// group, plus the event-hub group when known).
    pub resource_groups: Vec<String>,
    /// Compute usage.
    pub compute: ComputeUsage,
    /// Network usage.
    pub networking: NetworkUsage,
    /// Event-hub usage; zeroed when no event-hub resource group is known.
    pub event_hub: EventHubUsage,
}

/// Serialized usage event handed to the downstream sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Tenant the event is billed to (the cluster's subaccount id).
    pub data_tenant: String,
    /// Serialized [`EventData`] payload.
    pub payload: serde_json::Value,
}

/// Live per-cluster state owned by the instance cache.
///
/// Exactly one `Instance` exists per [`ClusterId`]. Workers re-read the entry
/// at the start of every cycle and write the mutated copy back at the end;
/// the work queue's per-key serialization keeps that read-modify-write free
/// of races.
#[derive(Debug, Clone)]
pub struct Instance<C> {
    /// The cluster snapshot this instance was built from.
    pub cluster: Cluster,
    /// Provider client handle for this cluster.
    pub client: C,
    /// Event-hub resource group, resolved lazily by tag lookup.
    pub event_hub_resource_group: Option<String>,
    /// Most recent successfully computed event payload, re-sent on failure.
    pub last_event: Option<EventData>,
    /// Consecutive own-resource-group-not-found observations.
    pub retry_attempts: u32,
    /// One-shot self-throttle flag; skips the next fetch when set.
    pub retry_backoff: bool,
}

impl<C> Instance<C> {
    /// Creates a fresh instance with no carried-over state.
    #[must_use]
    pub fn new(cluster: Cluster, client: C) -> Self {
        Self {
            cluster,
            client,
            event_hub_resource_group: None,
            last_event: None,
            retry_attempts: 0,
            retry_backoff: false,
        }
    }
}
