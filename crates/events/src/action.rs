use chrono::{DateTime, Utc};

use crate::detail::Detail;
use crate::envelope::CloudEvent;
use crate::error::Error;

/// An AutoScaling Group lifecycle action extracted from a terminate event.
///
/// Lives only for the duration of one handler invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleAction {
    /// The instance being terminated.
    pub instance_id: String,

    /// The AutoScaling Group the instance belongs to.
    pub auto_scaling_group_name: String,

    /// The lifecycle hook pausing termination.
    pub lifecycle_hook_name: String,

    /// Token identifying this specific action.
    pub token: String,

    /// When the action started (the envelope's `time`).
    pub start: DateTime<Utc>,
}

impl TryFrom<&CloudEvent> for LifecycleAction {
    type Error = Error;

    fn try_from(event: &CloudEvent) -> Result<Self, Error> {
        let Detail::TerminateAction(detail) = &event.detail else {
            return Err(Error::InvalidLifecycleAction("terminate action detail"));
        };
        if detail.ec2_instance_id.is_empty() {
            return Err(Error::InvalidLifecycleAction("EC2InstanceId"));
        }
        if detail.auto_scaling_group_name.is_empty() {
            return Err(Error::InvalidLifecycleAction("AutoScalingGroupName"));
        }
        if detail.lifecycle_hook_name.is_empty() {
            return Err(Error::InvalidLifecycleAction("LifecycleHookName"));
        }
        if detail.lifecycle_action_token.is_empty() {
            return Err(Error::InvalidLifecycleAction("LifecycleActionToken"));
        }

        Ok(Self {
            instance_id: detail.ec2_instance_id.clone(),
            auto_scaling_group_name: detail.auto_scaling_group_name.clone(),
            lifecycle_hook_name: detail.lifecycle_hook_name.clone(),
            token: detail.lifecycle_action_token.clone(),
            start: event.time,
        })
    }
}
