use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_autoscaling::error::ProvideErrorMetadata;
use esdrain_events::LifecycleAction;
use tracing::debug;

use crate::error::{Error, Result};

// AWS defaults when the hook description omits a timeout.
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i32 = 3600;
const DEFAULT_GLOBAL_TIMEOUT_SECS: i32 = 172_800;

/// The message prefix AWS uses when a heartbeat names an expired or unknown
/// action token.
const NO_ACTIVE_ACTION_PREFIX: &str = "No active Lifecycle Action found with token";

/// A lifecycle hook's timeout configuration, cached by `group:hook`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleHookDescription {
    /// The AutoScaling Group name.
    pub auto_scaling_group_name: String,

    /// The lifecycle hook name.
    pub lifecycle_hook_name: String,

    /// How long one heartbeat keeps the action alive.
    pub heartbeat_timeout: Duration,

    /// The maximum total time the action may be postponed.
    pub global_timeout: Duration,
}

/// The AutoScaling seam the postponer and orchestrator talk through.
#[async_trait]
pub trait AutoScalingApi: Send + Sync + 'static {
    /// Fetches the hook's timeout configuration.
    async fn describe_lifecycle_hook(
        &self,
        group: &str,
        hook: &str,
    ) -> Result<LifecycleHookDescription>;

    /// Records a heartbeat for the action, resetting its per-heartbeat
    /// timeout. Returns [`Error::ActionTimedOut`] when the provider replies
    /// that no active action exists for the token.
    async fn record_heartbeat(&self, action: &LifecycleAction) -> Result<()>;

    /// Completes the action with the given result (`CONTINUE` or `ABANDON`).
    async fn complete_lifecycle_action(
        &self,
        action: &LifecycleAction,
        result: &str,
    ) -> Result<()>;
}

/// AutoScaling-SDK-backed implementation.
pub struct AutoScaling {
    client: aws_sdk_autoscaling::Client,
}

impl AutoScaling {
    /// Creates a new `AutoScaling`.
    #[must_use]
    pub const fn new(client: aws_sdk_autoscaling::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AutoScalingApi for AutoScaling {
    async fn describe_lifecycle_hook(
        &self,
        group: &str,
        hook: &str,
    ) -> Result<LifecycleHookDescription> {
        let response = self
            .client
            .describe_lifecycle_hooks()
            .auto_scaling_group_name(group)
            .lifecycle_hook_names(hook)
            .send()
            .await
            .map_err(|e| Error::AutoScaling(Box::new(e.into())))?;

        let description = response
            .lifecycle_hooks()
            .first()
            .ok_or_else(|| Error::HookNotFound {
                group: group.to_owned(),
                hook: hook.to_owned(),
            })?;
        debug!(group, hook, "described lifecycle hook");

        Ok(LifecycleHookDescription {
            auto_scaling_group_name: group.to_owned(),
            lifecycle_hook_name: hook.to_owned(),
            heartbeat_timeout: seconds(
                description
                    .heartbeat_timeout()
                    .unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            ),
            global_timeout: seconds(
                description
                    .global_timeout()
                    .unwrap_or(DEFAULT_GLOBAL_TIMEOUT_SECS),
            ),
        })
    }

    async fn record_heartbeat(&self, action: &LifecycleAction) -> Result<()> {
        let result = self
            .client
            .record_lifecycle_action_heartbeat()
            .auto_scaling_group_name(&action.auto_scaling_group_name)
            .lifecycle_hook_name(&action.lifecycle_hook_name)
            .instance_id(&action.instance_id)
            .lifecycle_action_token(&action.token)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                let not_found = error.code() == Some("ValidationError")
                    && error
                        .message()
                        .is_some_and(|m| m.starts_with(NO_ACTIVE_ACTION_PREFIX));
                if not_found {
                    Err(Error::ActionTimedOut)
                } else {
                    Err(Error::AutoScaling(Box::new(error.into())))
                }
            }
        }
    }

    async fn complete_lifecycle_action(
        &self,
        action: &LifecycleAction,
        result: &str,
    ) -> Result<()> {
        self.client
            .complete_lifecycle_action()
            .auto_scaling_group_name(&action.auto_scaling_group_name)
            .lifecycle_hook_name(&action.lifecycle_hook_name)
            .instance_id(&action.instance_id)
            .lifecycle_action_token(&action.token)
            .lifecycle_action_result(result)
            .send()
            .await
            .map_err(|e| Error::AutoScaling(Box::new(e.into())))?;
        Ok(())
    }
}

fn seconds(value: i32) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}
