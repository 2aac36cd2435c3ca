//! Keeps AutoScaling lifecycle actions alive while a node drains.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod api;
mod error;

pub use api::{AutoScaling, AutoScalingApi, LifecycleHookDescription};
pub use error::{Error, Result};

use std::num::NonZeroUsize;
use std::sync::Arc;

use esdrain_events::LifecycleAction;
use lru::LruCache;
use prometheus::IntCounter;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The result value that lets the AutoScaling Group proceed.
pub const ACTION_RESULT_CONTINUE: &str = "CONTINUE";

const HOOK_CACHE_CAPACITY: usize = 10;

/// Options for creating a new [`LifecycleActionPostponer`].
pub struct LifecycleActionPostponerOptions<A> {
    /// The AutoScaling seam.
    pub api: Arc<A>,

    /// Counter of successfully recorded heartbeats, if instrumented.
    pub heartbeats: Option<IntCounter>,
}

/// Postpones a lifecycle action's timeout until the caller cancels or the
/// hook's global timeout is reached.
///
/// Heartbeats are always scheduled halfway between now and the action's
/// current deadline, so the action cannot expire even under moderate clock
/// skew. Hook descriptions are cached across invocations.
pub struct LifecycleActionPostponer<A> {
    api: Arc<A>,
    heartbeats: Option<IntCounter>,
    hook_cache: Mutex<LruCache<String, LifecycleHookDescription>>,
}

impl<A: AutoScalingApi> LifecycleActionPostponer<A> {
    /// Creates a new `LifecycleActionPostponer`.
    ///
    /// # Panics
    ///
    /// Never; the cache capacity is a nonzero constant.
    #[must_use]
    pub fn new(
        LifecycleActionPostponerOptions { api, heartbeats }: LifecycleActionPostponerOptions<A>,
    ) -> Self {
        Self {
            api,
            heartbeats,
            hook_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HOOK_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    /// Records heartbeats for the action until one of:
    ///
    /// - the token is cancelled ([`Error::Cancelled`]; the normal exit once
    ///   the node is empty or gone),
    /// - the hook's global timeout elapses ([`Error::ActionTimedOut`]),
    /// - the provider reports no active action for the token
    ///   ([`Error::ActionTimedOut`]),
    /// - any other AutoScaling error occurs.
    ///
    /// No heartbeat is recorded after the token is cancelled.
    ///
    /// # Errors
    ///
    /// Always returns one of the errors above; postponing has no success
    /// exit of its own.
    pub async fn postpone(
        &self,
        token: &CancellationToken,
        action: &LifecycleAction,
    ) -> Result<()> {
        let hook = self
            .describe_hook(&action.auto_scaling_group_name, &action.lifecycle_hook_name)
            .await?;

        let global_timeout = sleep_until(Instant::now() + hook.global_timeout);
        tokio::pin!(global_timeout);

        // Map the action's wall-clock start onto the monotonic clock; an
        // action received late has already consumed part of its timeout.
        let elapsed = (chrono::Utc::now() - action.start).to_std().unwrap_or_default();
        let mut deadline = Instant::now() + hook.heartbeat_timeout.saturating_sub(elapsed);

        loop {
            let now = Instant::now();
            let halfway = now + deadline.saturating_duration_since(now) / 2;

            tokio::select! {
                // Cancellation wins over a due heartbeat.
                biased;

                () = token.cancelled() => return Err(Error::Cancelled),

                () = &mut global_timeout => return Err(Error::ActionTimedOut),

                () = sleep_until(halfway) => {
                    self.api.record_heartbeat(action).await?;
                    if let Some(counter) = &self.heartbeats {
                        counter.inc();
                    }
                    debug!(
                        group = %action.auto_scaling_group_name,
                        hook = %action.lifecycle_hook_name,
                        instance = %action.instance_id,
                        "recorded lifecycle action heartbeat"
                    );
                    deadline += hook.heartbeat_timeout;
                }
            }
        }
    }

    async fn describe_hook(&self, group: &str, hook: &str) -> Result<LifecycleHookDescription> {
        let key = format!("{group}:{hook}");
        if let Some(description) = self.hook_cache.lock().await.get(&key) {
            debug!(group, hook, "got lifecycle hook from cache");
            return Ok(description.clone());
        }

        let description = self.api.describe_lifecycle_hook(group, hook).await?;
        self.hook_cache.lock().await.put(key, description.clone());
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    struct MockAutoScaling {
        hook: LifecycleHookDescription,
        heartbeats: StdMutex<Vec<Instant>>,
        describes: AtomicUsize,
        action_gone: AtomicBool,
    }

    impl MockAutoScaling {
        fn new(heartbeat_secs: u64, global_secs: u64) -> Self {
            Self {
                hook: LifecycleHookDescription {
                    auto_scaling_group_name: "es-data".to_owned(),
                    lifecycle_hook_name: "drain-hook".to_owned(),
                    heartbeat_timeout: Duration::from_secs(heartbeat_secs),
                    global_timeout: Duration::from_secs(global_secs),
                },
                heartbeats: StdMutex::new(Vec::new()),
                describes: AtomicUsize::new(0),
                action_gone: AtomicBool::new(false),
            }
        }

        fn heartbeat_instants(&self) -> Vec<Instant> {
            self.heartbeats.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AutoScalingApi for MockAutoScaling {
        async fn describe_lifecycle_hook(
            &self,
            _group: &str,
            _hook: &str,
        ) -> Result<LifecycleHookDescription> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            Ok(self.hook.clone())
        }

        async fn record_heartbeat(&self, _action: &LifecycleAction) -> Result<()> {
            if self.action_gone.load(Ordering::SeqCst) {
                return Err(Error::ActionTimedOut);
            }
            self.heartbeats.lock().unwrap().push(Instant::now());
            Ok(())
        }

        async fn complete_lifecycle_action(
            &self,
            _action: &LifecycleAction,
            _result: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn action() -> LifecycleAction {
        LifecycleAction {
            instance_id: "i-0123456789abcdef0".to_owned(),
            auto_scaling_group_name: "es-data".to_owned(),
            lifecycle_hook_name: "drain-hook".to_owned(),
            token: "tok".to_owned(),
            start: Utc::now(),
        }
    }

    fn postponer(api: Arc<MockAutoScaling>) -> LifecycleActionPostponer<MockAutoScaling> {
        LifecycleActionPostponer::new(LifecycleActionPostponerOptions {
            api,
            heartbeats: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_counter_tracks_successes() {
        let api = Arc::new(MockAutoScaling::new(60, 300));
        let counter = IntCounter::new("heartbeats_recorded_total", "heartbeats").unwrap();
        let postponer = LifecycleActionPostponer::new(LifecycleActionPostponerOptions {
            api: api.clone(),
            heartbeats: Some(counter.clone()),
        });
        let token = CancellationToken::new();

        let result = postponer.postpone(&token, &action()).await;

        assert!(matches!(result, Err(Error::ActionTimedOut)));
        assert_eq!(counter.get(), api.heartbeat_instants().len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_returns_sentinel() {
        let api = Arc::new(MockAutoScaling::new(60, 300));
        let postponer = postponer(api.clone());
        let token = CancellationToken::new();

        let begin = Instant::now();
        let result = postponer.postpone(&token, &action()).await;

        assert!(matches!(result, Err(Error::ActionTimedOut)));
        assert_eq!(begin.elapsed(), Duration::from_secs(300));
        assert!(
            !api.heartbeat_instants().is_empty(),
            "heartbeats kept the action alive until the global timeout"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_gap_never_exceeds_timeout() {
        let api = Arc::new(MockAutoScaling::new(60, 600));
        let postponer = postponer(api.clone());
        let token = CancellationToken::new();

        let begin = Instant::now();
        let _ = postponer.postpone(&token, &action()).await;

        let instants = api.heartbeat_instants();
        assert!(!instants.is_empty());
        let mut last = begin;
        for instant in instants {
            assert!(
                instant.duration_since(last) <= Duration::from_secs(60),
                "gap between heartbeats exceeded the heartbeat timeout"
            );
            last = instant;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_prompt_and_final() {
        let api = Arc::new(MockAutoScaling::new(60, 600));
        let postponer = postponer(api.clone());
        let token = CancellationToken::new();

        let task = {
            let token = token.clone();
            let act = action();
            tokio::spawn(async move { postponer.postpone(&token, &act).await })
        };

        tokio::time::sleep(Duration::from_secs(40)).await;
        let before_cancel = api.heartbeat_instants().len();
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(
            api.heartbeat_instants().len(),
            before_cancel,
            "no heartbeat may be recorded after cancellation"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_not_found_maps_to_timeout() {
        let api = Arc::new(MockAutoScaling::new(60, 600));
        api.action_gone.store(true, Ordering::SeqCst);
        let postponer = postponer(api);
        let token = CancellationToken::new();

        let result = postponer.postpone(&token, &action()).await;
        assert!(matches!(result, Err(Error::ActionTimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_description_is_cached() {
        let api = Arc::new(MockAutoScaling::new(60, 600));
        let postponer = postponer(api.clone());

        for _ in 0..3 {
            let token = CancellationToken::new();
            token.cancel();
            let result = postponer.postpone(&token, &action()).await;
            assert!(matches!(result, Err(Error::Cancelled)));
        }

        assert_eq!(api.describes.load(Ordering::SeqCst), 1);
    }
}
