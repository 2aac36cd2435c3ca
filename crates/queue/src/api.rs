use async_trait::async_trait;
use aws_sdk_ec2::types::Filter;
use aws_sdk_sqs::types::DeleteMessageBatchRequestEntry;

use crate::error::{Error, Result};

// SQS hard limits for a single receive call.
const MAX_MESSAGES: i32 = 10;
const WAIT_TIME_SECONDS: i32 = 20;

/// One received queue message.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    /// The raw message body (a JSON cloud event envelope).
    pub body: String,

    /// Receipt handle used to delete the message.
    pub receipt_handle: String,
}

/// The queue seam the consumer talks through.
#[async_trait]
pub trait SqsApi: Send + Sync + 'static {
    /// Long-polls the queue for up to 10 messages, waiting up to 20 seconds.
    async fn receive(&self) -> Result<Vec<QueueMessage>>;

    /// Deletes a batch of handled messages by receipt handle.
    async fn delete_batch(&self, messages: &[QueueMessage]) -> Result<()>;
}

/// An EC2 instance described by the membership filter.
#[derive(Clone, Debug)]
pub struct Ec2Instance {
    /// The instance ID.
    pub instance_id: String,

    /// The instance's private IP, if it has one.
    pub private_ip: Option<String>,

    /// The instance's `Name` tag, if set.
    pub name: Option<String>,
}

/// The instance-describe seam used for cluster-membership filtering.
#[async_trait]
pub trait Ec2Api: Send + Sync + 'static {
    /// Describes the given instances, filtered to those whose `Name` tag
    /// starts with the cluster name. An empty cluster name disables the tag
    /// filter and matches on instance IDs alone.
    async fn cluster_members(
        &self,
        cluster_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Ec2Instance>>;
}

/// SQS-backed queue client.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    /// Creates a new `SqsQueue` for the given queue URL.
    #[must_use]
    pub const fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl SqsApi for SqsQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(MAX_MESSAGES)
            .wait_time_seconds(WAIT_TIME_SECONDS)
            .send()
            .await
            .map_err(|e| Error::Sqs(e.into()))?;

        Ok(response
            .messages()
            .iter()
            .filter_map(|m| {
                Some(QueueMessage {
                    body: m.body()?.to_owned(),
                    receipt_handle: m.receipt_handle()?.to_owned(),
                })
            })
            .collect())
    }

    async fn delete_batch(&self, messages: &[QueueMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let entries = messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .receipt_handle(&m.receipt_handle)
                    .build()
                    .map_err(|e| Error::DeleteEntry(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        self.client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| Error::Sqs(e.into()))?;

        Ok(())
    }
}

/// EC2-backed instance describer.
pub struct Ec2Instances {
    client: aws_sdk_ec2::Client,
}

impl Ec2Instances {
    /// Creates a new `Ec2Instances`.
    #[must_use]
    pub const fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Ec2Api for Ec2Instances {
    async fn cluster_members(
        &self,
        cluster_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<Ec2Instance>> {
        let mut request = self
            .client
            .describe_instances()
            .set_instance_ids(Some(instance_ids.to_vec()));
        if !cluster_name.is_empty() {
            request = request.filters(
                Filter::builder()
                    .name("tag:Name")
                    .values(format!("{cluster_name}*"))
                    .build(),
            );
        }

        let response = request.send().await.map_err(|e| Error::Ec2(e.into()))?;

        let mut instances = Vec::new();
        for reservation in response.reservations() {
            for instance in reservation.instances() {
                let Some(instance_id) = instance.instance_id() else {
                    continue;
                };
                let name = instance
                    .tags()
                    .iter()
                    .find(|t| t.key() == Some("Name"))
                    .and_then(|t| t.value())
                    .map(ToOwned::to_owned);
                instances.push(Ec2Instance {
                    instance_id: instance_id.to_owned(),
                    private_ip: instance.private_ip_address().map(ToOwned::to_owned),
                    name,
                });
            }
        }
        Ok(instances)
    }
}
