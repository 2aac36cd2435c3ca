use std::collections::BTreeSet;

use serde_json::{json, Value};

/// The `cluster.routing.allocation.exclude` record.
///
/// Each field is a set of identifiers; the wire format is a comma-joined
/// string per field, or an explicit `null` to clear the field. There is no
/// remove-one-element primitive — the whole field is rewritten on every
/// update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardAllocationExcludeSettings {
    /// Excluded node names (`_name`).
    pub name: BTreeSet<String>,

    /// Excluded node IPs (`_ip`).
    pub ip: BTreeSet<String>,

    /// Excluded host attributes (`_host`).
    pub host: BTreeSet<String>,
}

impl ShardAllocationExcludeSettings {
    /// Extracts the transient exclusion settings from a
    /// `GET /_cluster/settings` response.
    #[must_use]
    pub fn from_cluster_settings(settings: &Value) -> Self {
        let exclude = &settings["transient"]["cluster"]["routing"]["allocation"]["exclude"];
        Self {
            name: split_field(&exclude["_name"]),
            ip: split_field(&exclude["_ip"]),
            host: split_field(&exclude["_host"]),
        }
    }

    /// Renders the whole record as a `PUT /_cluster/settings` body.
    ///
    /// Empty fields are sent as explicit `null` so the server clears them.
    #[must_use]
    pub fn to_transient_body(&self) -> Value {
        json!({
            "transient": {
                "cluster.routing.allocation.exclude": {
                    "_name": join_field(&self.name),
                    "_ip": join_field(&self.ip),
                    "_host": join_field(&self.host),
                }
            }
        })
    }
}

fn split_field(value: &Value) -> BTreeSet<String> {
    value
        .as_str()
        .map(|s| {
            s.split(',')
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn join_field(field: &BTreeSet<String>) -> Value {
    if field.is_empty() {
        Value::Null
    } else {
        Value::String(field.iter().cloned().collect::<Vec<_>>().join(","))
    }
}
