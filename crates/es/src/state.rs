use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::settings::ShardAllocationExcludeSettings;

/// An immutable view of the Elasticsearch cluster at one instant.
///
/// A new snapshot replaces the previous one atomically; nothing mutates a
/// snapshot after construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterState {
    /// Node identifiers (IPs), sorted ascending and deduped.
    pub nodes: Vec<String>,

    /// Shard count per node. Nodes with zero shards are omitted.
    pub shards: HashMap<String, u64>,

    /// The current shard-allocation exclusions.
    pub exclusions: ShardAllocationExcludeSettings,
}

#[derive(Debug, Deserialize)]
struct NodesInfoResponse {
    #[serde(default)]
    nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatShardRow {
    #[serde(default)]
    ip: Option<String>,
}

impl ClusterState {
    /// Assembles a snapshot from the raw nodes-info, cat-shards, and
    /// cluster-settings responses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedResponse`] if a response body does not
    /// have the expected shape.
    pub fn from_responses(nodes_info: &Value, cat_shards: &Value, settings: &Value) -> Result<Self> {
        let info: NodesInfoResponse =
            serde_json::from_value(nodes_info.clone()).map_err(|source| {
                Error::UnexpectedResponse {
                    path: "/_nodes/_all".to_owned(),
                    source,
                }
            })?;
        let mut nodes: Vec<String> = info.nodes.into_values().filter_map(|n| n.ip).collect();
        nodes.sort_unstable();
        nodes.dedup();

        let rows: Vec<CatShardRow> =
            serde_json::from_value(cat_shards.clone()).map_err(|source| {
                Error::UnexpectedResponse {
                    path: "/_cat/shards".to_owned(),
                    source,
                }
            })?;
        let mut shards: HashMap<String, u64> = HashMap::new();
        for row in &rows {
            if let Some(cell) = &row.ip {
                for node in parse_shard_nodes(cell) {
                    *shards.entry(node.to_owned()).or_default() += 1;
                }
            }
        }

        Ok(Self {
            nodes,
            shards,
            exclusions: ShardAllocationExcludeSettings::from_cluster_settings(settings),
        })
    }

    /// Whether a node with the given identifier is in the cluster.
    ///
    /// # Panics
    ///
    /// Panics if the node slice is unsorted; that is a programmer error,
    /// construction always sorts.
    #[must_use]
    pub fn has_node(&self, name: &str) -> bool {
        assert!(
            self.nodes.windows(2).all(|w| w[0] <= w[1]),
            "node slice must be sorted"
        );
        self.nodes.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }

    /// The difference between the nodes of two snapshots: `(added, removed)`
    /// going from `old` to `new`.
    ///
    /// A missing `old` means everything in `new` was added; a missing `new`
    /// means everything in `old` was removed.
    ///
    /// # Panics
    ///
    /// Panics if either node slice is unsorted (programmer error).
    #[must_use]
    pub fn diff_nodes(old: Option<&Self>, new: Option<&Self>) -> (Vec<String>, Vec<String>) {
        let (mut added, mut removed) = (Vec::new(), Vec::new());
        match (old, new) {
            (None, None) => {}
            (None, Some(new)) => added.extend(new.nodes.iter().cloned()),
            (Some(old), None) => removed.extend(old.nodes.iter().cloned()),
            (Some(old), Some(new)) => {
                assert!(
                    old.nodes.windows(2).all(|w| w[0] <= w[1])
                        && new.nodes.windows(2).all(|w| w[0] <= w[1]),
                    "node slices must be sorted"
                );
                let (mut i, mut j) = (0, 0);
                while i < old.nodes.len() && j < new.nodes.len() {
                    match old.nodes[i].cmp(&new.nodes[j]) {
                        std::cmp::Ordering::Less => {
                            removed.push(old.nodes[i].clone());
                            i += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            added.push(new.nodes[j].clone());
                            j += 1;
                        }
                        std::cmp::Ordering::Equal => {
                            i += 1;
                            j += 1;
                        }
                    }
                }
                removed.extend(old.nodes[i..].iter().cloned());
                added.extend(new.nodes[j..].iter().cloned());
            }
        }
        (added, removed)
    }

    /// Per-node shard-count deltas going from `old` to `new`; a node missing
    /// on one side counts as zero there.
    #[must_use]
    pub fn diff_shards(old: Option<&Self>, new: Option<&Self>) -> HashMap<String, i64> {
        let mut out = HashMap::new();
        if let Some(old) = old {
            for (node, count) in &old.shards {
                let new_count = new.and_then(|s| s.shards.get(node)).copied().unwrap_or(0);
                out.insert(node.clone(), i64::try_from(new_count).unwrap_or(i64::MAX) - i64::try_from(*count).unwrap_or(i64::MAX));
            }
        }
        if let Some(new) = new {
            for (node, count) in &new.shards {
                if !old.is_some_and(|s| s.shards.contains_key(node)) {
                    out.insert(node.clone(), i64::try_from(*count).unwrap_or(i64::MAX));
                }
            }
        }
        out
    }
}

/// Interprets the `/_cat/shards` IP cell.
///
/// The cell is empty for an unassigned shard, one token for an assigned
/// shard, or a six-token relocation expression
/// (`IP NAME -> IP ID NAME`) naming the source and destination nodes.
/// Any other non-empty shape is logged and skipped so a surprising server
/// response cannot take the poll loop down.
#[must_use]
pub fn parse_shard_nodes(cell: &str) -> Vec<&str> {
    if cell.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = cell.split_whitespace().collect();
    match parts.len() {
        1 => vec![parts[0]],
        6 => vec![parts[0], parts[3]],
        _ => {
            warn!(cell, "unrecognized cat-shards node cell, skipping");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn state(nodes: &[&str], shards: &[(&str, u64)]) -> ClusterState {
        ClusterState {
            nodes: nodes.iter().map(|&n| n.to_owned()).collect(),
            shards: shards.iter().map(|&(n, c)| (n.to_owned(), c)).collect(),
            exclusions: ShardAllocationExcludeSettings::default(),
        }
    }

    #[test]
    fn test_from_responses_sorts_and_dedups() {
        let nodes_info = json!({
            "nodes": {
                "abc": { "ip": "10.0.0.2" },
                "def": { "ip": "10.0.0.1" },
                "ghi": { "ip": "10.0.0.1" },
                "jkl": {}
            }
        });
        let cat_shards = json!([
            { "ip": "10.0.0.1" },
            { "ip": "10.0.0.1" },
            { "ip": null },
            { "ip": "10.0.0.2 node-2 -> 10.0.0.1 UNq6sOGN node-1" }
        ]);

        let state = ClusterState::from_responses(&nodes_info, &cat_shards, &json!({})).unwrap();
        assert_eq!(state.nodes, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(state.shards["10.0.0.1"], 3);
        assert_eq!(state.shards["10.0.0.2"], 1);
    }

    #[test]
    fn test_from_responses_rejects_bad_shape() {
        let err = ClusterState::from_responses(&json!({"nodes": 3}), &json!([]), &json!({}));
        assert!(matches!(err, Err(Error::UnexpectedResponse { .. })));
    }

    #[test]
    fn test_has_node() {
        let state = state(&["10.0.0.1", "10.0.0.2"], &[]);
        assert!(state.has_node("10.0.0.1"));
        assert!(!state.has_node("10.0.0.9"));
    }

    #[test]
    #[should_panic(expected = "sorted")]
    fn test_has_node_panics_on_unsorted() {
        let state = state(&["10.0.0.2", "10.0.0.1"], &[]);
        let _ = state.has_node("10.0.0.1");
    }

    #[test]
    fn test_diff_nodes() {
        let old = state(&["a", "b", "c"], &[]);
        let new = state(&["b", "c", "d", "e"], &[]);

        let (added, removed) = ClusterState::diff_nodes(Some(&old), Some(&new));
        assert_eq!(added, vec!["d", "e"]);
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn test_diff_nodes_nil_sides() {
        let only = state(&["a", "b"], &[]);

        let (added, removed) = ClusterState::diff_nodes(None, Some(&only));
        assert_eq!(added, vec!["a", "b"]);
        assert!(removed.is_empty());

        let (added, removed) = ClusterState::diff_nodes(Some(&only), None);
        assert!(added.is_empty());
        assert_eq!(removed, vec!["a", "b"]);
    }

    #[test]
    fn test_diff_nodes_partitions_both_sides() {
        // added ∪ (old ∩ new) = new and removed ∪ (old ∩ new) = old,
        // with added and removed disjoint.
        let old = state(&["a", "c", "e"], &[]);
        let new = state(&["b", "c", "d"], &[]);

        let (added, removed) = ClusterState::diff_nodes(Some(&old), Some(&new));
        assert_eq!(added, vec!["b", "d"]);
        assert_eq!(removed, vec!["a", "e"]);
        assert!(added.iter().all(|n| !removed.contains(n)));
    }

    #[test]
    fn test_diff_shards() {
        let old = state(&[], &[("a", 5), ("b", 2)]);
        let new = state(&[], &[("a", 3), ("c", 4)]);

        let deltas = ClusterState::diff_shards(Some(&old), Some(&new));
        assert_eq!(deltas["a"], -2);
        assert_eq!(deltas["b"], -2);
        assert_eq!(deltas["c"], 4);
    }

    #[test]
    fn test_parse_shard_nodes() {
        assert!(parse_shard_nodes("").is_empty());
        assert_eq!(parse_shard_nodes("10.0.0.1"), vec!["10.0.0.1"]);
        assert_eq!(
            parse_shard_nodes("10.0.0.1 node-1 -> 10.0.0.2 UNq6sOGN node-2"),
            vec!["10.0.0.1", "10.0.0.2"]
        );
        // Unrecognized shapes are skipped, not fatal.
        assert!(parse_shard_nodes("10.0.0.1 ->").is_empty());
        assert!(parse_shard_nodes("a b c d e").is_empty());
    }
}
