//! Cloud-resource usage metering pipeline.
//!
//! `skymeter-collector` turns a feed of managed-cluster snapshots into a
//! stream of per-subaccount usage events. It polls each cluster's cloud
//! provider on a fixed cadence, aggregates compute, network, and event-hub
//! usage, and hands serialized events to a downstream sink channel.
//!
//! # Architecture
//!
//! ```text
//!  discovery feed ──▶ intake ──▶ instance cache ──▶ work queue
//!                       │            ▲                  │
//!                       ▼            │                  ▼
//!               vm-capability     write-back       worker pool ──▶ event sink
//!                  cache                           (N pollers)
//! ```
//!
//! - **Intake** consumes cluster snapshots in order, upserting or deleting
//!   instance-cache entries and admitting cluster ids into the work queue.
//! - **Workers** claim ids from the queue (at most one worker per id), run a
//!   metering cycle against the provider, emit a usage event, and re-admit
//!   the id after the poll interval.
//! - On provider failures the last successful event is re-sent; repeated
//!   own-resource-group-not-found observations remove the cluster.
//!
//! # Example
//!
//! ```rust
//! use tokio::sync::mpsc;
//! use skymeter_collector::{Collector, CollectorConfig, ProviderRegistry, ScriptedClient};
//!
//! let mut registry = ProviderRegistry::new();
//! let client = ScriptedClient::default();
//! registry.register("az", client.builder()).expect("register provider");
//!
//! let (events_tx, _events_rx) = mpsc::channel(64);
//! let collector = Collector::new(
//!     CollectorConfig::default(),
//!     registry.builder("az").expect("resolve provider"),
//!     events_tx,
//! );
//!
//! // Keep a feed handle, then drive the pipeline on a runtime:
//! // feed.send(cluster).await and collector.run(shutdown_rx).await.
//! let feed = collector.feed();
//! # drop(feed);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod collector;
pub mod config;
pub mod error;
pub mod provider;
pub mod types;

mod intake;
mod worker;

pub use collector::Collector;
pub use config::CollectorConfig;
pub use error::{CollectorError, ProviderError};
pub use provider::{ClientBuilder, ProviderClient, ProviderRegistry, ScriptedClient};
pub use types::{Cluster, ClusterId, EventData, Instance, UsageEvent};
