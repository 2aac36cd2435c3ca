//! Elasticsearch cluster-state snapshots and the drain/undrain facade.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod settings;
mod state;
mod transport;

pub use error::{Error, Result};
pub use settings::ShardAllocationExcludeSettings;
pub use state::{parse_shard_nodes, ClusterState};
pub use transport::{Backoff, EsTransport, HttpTransport, HttpTransportOptions};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

const PATH_NODES: &str = "/_nodes/_all";
const PATH_CAT_SHARDS: &str = "/_cat/shards?format=json&h=ip";
const PATH_SETTINGS: &str = "/_cluster/settings?filter_path=*.cluster.routing.allocation.exclude.*";
const PATH_HEALTH: &str = "/_cluster/health";

/// Idempotent drain/undrain/snapshot operations over the Elasticsearch API.
///
/// Mutations of the exclusion settings are read-modify-write cycles over a
/// cluster-wide resource, so the facade serializes its own writes with an
/// internal mutex. Concurrent writers in other processes are a
/// misconfiguration this facade does not defend against.
pub struct EsFacade<T> {
    transport: T,
    write_lock: Mutex<()>,
}

#[derive(Debug, Deserialize)]
struct ClusterHealthResponse {
    status: String,
}

impl<T: EsTransport> EsFacade<T> {
    /// Creates a facade over the given transport.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            write_lock: Mutex::const_new(()),
        }
    }

    /// The transport this facade talks through.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetches a consistent snapshot of the cluster state.
    ///
    /// The three underlying requests run concurrently; if any of them
    /// fails, the whole call fails and no partial snapshot is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if any sub-request fails or a response body does
    /// not have the expected shape.
    pub async fn get_state(&self) -> Result<ClusterState> {
        let (nodes_info, cat_shards, settings) = tokio::try_join!(
            self.transport.get_json(PATH_NODES),
            self.transport.get_json(PATH_CAT_SHARDS),
            self.transport.get_json(PATH_SETTINGS),
        )?;
        ClusterState::from_responses(&nodes_info, &cat_shards, &settings)
    }

    /// Excludes the given node identifiers from shard allocation, on top of
    /// whatever is already excluded.
    ///
    /// Idempotent: draining an already-drained node succeeds and leaves the
    /// settings body unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be read or written.
    pub async fn drain_nodes(&self, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut exclusions = self.fetch_exclusions().await?;
        exclusions.name.extend(nodes.iter().cloned());
        debug!(?nodes, "draining nodes");
        self.transport
            .put_settings(exclusions.to_transient_body())
            .await
    }

    /// Removes the given node identifiers from the shard-allocation
    /// exclusions. A field left empty is sent as explicit `null` so the
    /// server clears it. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be read or written.
    pub async fn undrain_nodes(&self, nodes: &[String]) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut exclusions = self.fetch_exclusions().await?;
        for node in nodes {
            exclusions.name.remove(node);
        }
        debug!(?nodes, "undraining nodes");
        self.transport
            .put_settings(exclusions.to_transient_body())
            .await
    }

    /// The cluster health status (`green`, `yellow`, or `red`).
    ///
    /// # Errors
    ///
    /// Returns an error if the health endpoint cannot be reached or its
    /// response does not have the expected shape.
    pub async fn cluster_health(&self) -> Result<String> {
        let body = self.transport.get_json(PATH_HEALTH).await?;
        let health: ClusterHealthResponse =
            serde_json::from_value(body).map_err(|source| Error::UnexpectedResponse {
                path: PATH_HEALTH.to_owned(),
                source,
            })?;
        Ok(health.status)
    }

    async fn fetch_exclusions(&self) -> Result<ShardAllocationExcludeSettings> {
        let settings = self.transport.get_json(PATH_SETTINGS).await?;
        Ok(ShardAllocationExcludeSettings::from_cluster_settings(
            &settings,
        ))
    }
}
