//! Mock implementations of the external seams, shared by the reconciler
//! and orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use esdrain_es::{Error as EsError, EsTransport, Result as EsResult};
use esdrain_events::LifecycleAction;
use esdrain_lifecycle::{AutoScalingApi, LifecycleHookDescription, Result as LifecycleResult};
use esdrain_queue::{
    Ec2Api, Ec2Instance, QueueMessage, Result as QueueResult, SqsApi,
};
use serde_json::{json, Value};

/// In-memory Elasticsearch cluster. A settings PUT updates the exclusion
/// state; when relocation is enabled, excluded nodes immediately shed all
/// their shards, simulating a completed evacuation.
pub struct MockCluster {
    nodes: Mutex<Vec<String>>,
    shards: Mutex<HashMap<String, u64>>,
    exclude: Mutex<Value>,
    puts: Mutex<Vec<Value>>,
    fail_gets: AtomicBool,
    relocate_on_drain: AtomicBool,
}

impl MockCluster {
    pub fn new(nodes: &[&str], shards: &[(&str, u64)]) -> Self {
        Self {
            nodes: Mutex::new(nodes.iter().map(|&n| n.to_owned()).collect()),
            shards: Mutex::new(shards.iter().map(|&(n, c)| (n.to_owned(), c)).collect()),
            exclude: Mutex::new(json!({})),
            puts: Mutex::new(Vec::new()),
            fail_gets: AtomicBool::new(false),
            relocate_on_drain: AtomicBool::new(false),
        }
    }

    pub fn set_excluded_names(&self, names: &str) {
        *self.exclude.lock().unwrap() = json!({ "_name": names });
    }

    pub fn set_relocate_on_drain(&self, enabled: bool) {
        self.relocate_on_drain.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub fn drain_and_relocate(&self, node: &str) {
        self.shards.lock().unwrap().remove(node);
    }

    pub fn last_put(&self) -> Option<Value> {
        self.puts.lock().unwrap().last().cloned()
    }

    pub fn puts(&self) -> Vec<Value> {
        self.puts.lock().unwrap().clone()
    }

    pub fn excluded_names(&self) -> Option<String> {
        self.exclude.lock().unwrap()["_name"]
            .as_str()
            .map(ToOwned::to_owned)
    }
}

#[async_trait]
impl EsTransport for MockCluster {
    async fn get_json(&self, path: &str) -> EsResult<Value> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(EsError::Status {
                status: 503,
                path: path.to_owned(),
            });
        }

        if path.starts_with("/_cluster/settings") {
            Ok(json!({
                "transient": {
                    "cluster": {
                        "routing": {
                            "allocation": { "exclude": self.exclude.lock().unwrap().clone() }
                        }
                    }
                }
            }))
        } else if path.starts_with("/_cat/shards") {
            let shards = self.shards.lock().unwrap();
            let rows: Vec<Value> = shards
                .iter()
                .flat_map(|(node, count)| {
                    std::iter::repeat_with(move || json!({ "ip": node })).take(*count as usize)
                })
                .collect();
            Ok(Value::Array(rows))
        } else if path.starts_with("/_cluster/health") {
            Ok(json!({ "status": "green" }))
        } else {
            let nodes = self.nodes.lock().unwrap();
            let entries: serde_json::Map<String, Value> = nodes
                .iter()
                .map(|n| (format!("id-{n}"), json!({ "ip": n })))
                .collect();
            Ok(json!({ "nodes": entries }))
        }
    }

    async fn put_settings(&self, body: Value) -> EsResult<()> {
        let exclude = body["transient"]["cluster.routing.allocation.exclude"].clone();
        if self.relocate_on_drain.load(Ordering::SeqCst) {
            if let Some(names) = exclude["_name"].as_str() {
                let mut shards = self.shards.lock().unwrap();
                for name in names.split(',') {
                    shards.remove(name);
                }
            }
        }
        *self.exclude.lock().unwrap() = exclude;
        self.puts.lock().unwrap().push(body);
        Ok(())
    }
}

/// Scripted queue: hands out the seeded batches, then long-polls forever.
pub struct MockSqs {
    batches: Mutex<VecDeque<Vec<QueueMessage>>>,
    deleted: Mutex<Vec<Vec<String>>>,
}

impl MockSqs {
    pub fn new(batches: Vec<Vec<QueueMessage>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn deleted_handles(&self) -> Vec<Vec<String>> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqsApi for MockSqs {
    async fn receive(&self) -> QueueResult<Vec<QueueMessage>> {
        let batch = self.batches.lock().unwrap().pop_front();
        match batch {
            Some(batch) => Ok(batch),
            None => futures::future::pending().await,
        }
    }

    async fn delete_batch(&self, messages: &[QueueMessage]) -> QueueResult<()> {
        self.deleted
            .lock()
            .unwrap()
            .push(messages.iter().map(|m| m.receipt_handle.clone()).collect());
        Ok(())
    }
}

/// Membership filter with a fixed member set.
pub struct MockEc2 {
    members: Vec<String>,
}

impl MockEc2 {
    pub fn new(members: &[&str]) -> Self {
        Self {
            members: members.iter().map(|&m| m.to_owned()).collect(),
        }
    }
}

#[async_trait]
impl Ec2Api for MockEc2 {
    async fn cluster_members(
        &self,
        _cluster_name: &str,
        instance_ids: &[String],
    ) -> QueueResult<Vec<Ec2Instance>> {
        Ok(self
            .members
            .iter()
            .filter(|m| instance_ids.contains(m))
            .map(|m| Ec2Instance {
                instance_id: m.clone(),
                private_ip: Some(m.clone()),
                name: Some(format!("es-data-{m}")),
            })
            .collect())
    }
}

/// AutoScaling stub with a fixed hook description.
pub struct MockAutoScaling {
    hook: LifecycleHookDescription,
    pub heartbeats: AtomicUsize,
    completions: Mutex<Vec<(String, String)>>,
}

impl MockAutoScaling {
    pub fn new(heartbeat: Duration, global: Duration) -> Self {
        Self {
            hook: LifecycleHookDescription {
                auto_scaling_group_name: "es-data".to_owned(),
                lifecycle_hook_name: "drain-hook".to_owned(),
                heartbeat_timeout: heartbeat,
                global_timeout: global,
            },
            heartbeats: AtomicUsize::new(0),
            completions: Mutex::new(Vec::new()),
        }
    }

    pub fn completions(&self) -> Vec<(String, String)> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AutoScalingApi for MockAutoScaling {
    async fn describe_lifecycle_hook(
        &self,
        _group: &str,
        _hook: &str,
    ) -> LifecycleResult<LifecycleHookDescription> {
        Ok(self.hook.clone())
    }

    async fn record_heartbeat(&self, _action: &LifecycleAction) -> LifecycleResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        action: &LifecycleAction,
        result: &str,
    ) -> LifecycleResult<()> {
        self.completions
            .lock()
            .unwrap()
            .push((action.instance_id.clone(), result.to_owned()));
        Ok(())
    }
}

/// A terminate-lifecycle envelope as it would arrive off the queue.
pub fn terminate_message(instance: &str, receipt: &str) -> QueueMessage {
    QueueMessage {
        body: format!(
            r#"{{
                "id": "evt-{receipt}",
                "detail-type": "EC2 Instance-terminate Lifecycle Action",
                "source": "aws.autoscaling",
                "time": "{}",
                "detail": {{
                    "LifecycleActionToken": "tok-{receipt}",
                    "AutoScalingGroupName": "es-data",
                    "LifecycleHookName": "drain-hook",
                    "EC2InstanceId": "{instance}"
                }}
            }}"#,
            chrono::Utc::now().to_rfc3339()
        ),
        receipt_handle: receipt.to_owned(),
    }
}

/// A spot-interruption envelope as it would arrive off the queue.
pub fn spot_message(instance: &str, receipt: &str) -> QueueMessage {
    QueueMessage {
        body: format!(
            r#"{{
                "id": "evt-{receipt}",
                "detail-type": "EC2 Spot Instance Interruption Warning",
                "source": "aws.ec2",
                "time": "{}",
                "detail": {{ "instance-id": "{instance}" }}
            }}"#,
            chrono::Utc::now().to_rfc3339()
        ),
        receipt_handle: receipt.to_owned(),
    }
}
