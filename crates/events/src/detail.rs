use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The `source` field of EC2-originated events.
pub const SOURCE_EC2: &str = "aws.ec2";

/// The `source` field of AutoScaling-originated events.
pub const SOURCE_AUTOSCALING: &str = "aws.autoscaling";

/// Detail-type of a spot interruption warning (~2 minutes' notice).
pub const DETAIL_SPOT_INTERRUPTION: &str = "EC2 Spot Instance Interruption Warning";

/// Detail-type of a rebalance recommendation (an early interruption signal).
pub const DETAIL_REBALANCE_RECOMMENDATION: &str = "EC2 Instance Rebalance Recommendation";

/// Detail-type of a terminate lifecycle action.
pub const DETAIL_TERMINATE_ACTION: &str = "EC2 Instance-terminate Lifecycle Action";

/// A decoded `detail` payload.
///
/// The set is closed: anything else decodes as
/// [`Error::UnknownDetailType`](crate::Error::UnknownDetailType).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Detail {
    /// `aws.ec2` / `EC2 Spot Instance Interruption Warning`.
    SpotInterruption(SpotInterruption),

    /// `aws.ec2` / `EC2 Instance Rebalance Recommendation`.
    RebalanceRecommendation(RebalanceRecommendation),

    /// `aws.autoscaling` / `EC2 Instance-terminate Lifecycle Action`.
    TerminateAction(TerminateAction),
}

impl Detail {
    /// The EC2 instance the event refers to.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            Self::SpotInterruption(d) => &d.instance_id,
            Self::RebalanceRecommendation(d) => &d.instance_id,
            Self::TerminateAction(d) => &d.ec2_instance_id,
        }
    }
}

/// Emitted by EC2 two minutes before a spot instance is interrupted.
///
/// Example:
///
/// ```json
/// { "instance-id": "i-0b662ef9731f8a5e1" }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct SpotInterruption {
    /// The ID of the spot instance about to be interrupted.
    #[serde(rename = "instance-id")]
    pub instance_id: String,
}

/// Emitted by EC2 when a spot instance is at elevated risk of interruption.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RebalanceRecommendation {
    /// The ID of the spot instance at risk.
    #[serde(rename = "instance-id")]
    pub instance_id: String,
}

/// Emitted by an AutoScaling Group when an instance-terminate lifecycle
/// hook pauses termination of an instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TerminateAction {
    /// The ID of the instance being terminated.
    #[serde(rename = "EC2InstanceId")]
    pub ec2_instance_id: String,

    /// The name of the AutoScaling Group.
    #[serde(rename = "AutoScalingGroupName")]
    pub auto_scaling_group_name: String,

    /// The name of the lifecycle hook that paused termination.
    #[serde(rename = "LifecycleHookName")]
    pub lifecycle_hook_name: String,

    /// Token identifying this specific lifecycle action.
    #[serde(rename = "LifecycleActionToken")]
    pub lifecycle_action_token: String,

    /// When the action started, if the detail carries it. The envelope
    /// `time` is authoritative.
    #[serde(rename = "Time", default)]
    pub time: Option<DateTime<Utc>>,

    /// The lifecycle transition, e.g. `autoscaling:EC2_INSTANCE_TERMINATING`.
    #[serde(rename = "LifecycleTransition", default)]
    pub lifecycle_transition: String,
}
