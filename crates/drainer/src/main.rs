//! Drains Elasticsearch nodes on EC2 instances that are about to be
//! terminated, and cleans up stale shard-allocation exclusions.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod app;
mod error;
mod health;
mod instrumentation;
mod reconciler;
#[cfg(test)]
mod testutil;

use app::{App, AppOptions};
use error::Result;
use health::ReadyState;
use instrumentation::Instrumentation;
use reconciler::{Reconciler, ReconcilerOptions};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use clap::Parser;
use esdrain_bus::Bus;
use esdrain_es::{Backoff, EsFacade, HttpTransport, HttpTransportOptions};
use esdrain_lifecycle::{AutoScaling, LifecycleActionPostponer, LifecycleActionPostponerOptions};
use esdrain_queue::{Ec2Instances, QueueEmitter, QueueEmitterOptions, SqsQueue};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(version, about = "Remove shards from Elasticsearch nodes on EC2 instances that are about to be terminated.", long_about = None)]
struct Args {
    /// URL of the Elasticsearch HTTP endpoint.
    #[arg(long, default_value = "http://localhost:9200", env = "ESDRAIN_ES_URL")]
    es_url: String,

    /// URL of the SQS queue delivering cloud events.
    #[arg(long, env = "ESDRAIN_QUEUE_URL")]
    queue_url: String,

    /// Name of the Elasticsearch cluster; events for instances whose Name
    /// tag does not start with it are ignored. Empty disables the filter.
    #[arg(long, default_value = "", env = "ESDRAIN_CLUSTER_NAME")]
    cluster_name: String,

    /// Seconds between cluster-state polls.
    #[arg(long, default_value_t = 30, env = "ESDRAIN_POLL_INTERVAL_SECONDS")]
    poll_interval_seconds: u64,

    /// AWS region; falls back to the SDK default chain when unset.
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// AWS shared credentials profile.
    #[arg(long, env = "AWS_PROFILE")]
    aws_profile: Option<String>,

    /// Max attempts for AWS calls that fail on connection errors.
    #[arg(long, default_value_t = 5, env = "ESDRAIN_AWS_MAX_RETRIES")]
    aws_max_retries: u32,

    /// Initial backoff for Elasticsearch connection retries, in milliseconds.
    #[arg(long, default_value_t = 500, env = "ESDRAIN_ES_BACKOFF_INIT_MS")]
    es_backoff_init_ms: u64,

    /// Max backoff for Elasticsearch connection retries, in milliseconds.
    /// Zero disables retrying.
    #[arg(long, default_value_t = 30_000, env = "ESDRAIN_ES_BACKOFF_MAX_MS")]
    es_backoff_max_ms: u64,

    /// Per-request timeout against Elasticsearch, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "ESDRAIN_ES_TIMEOUT_MS")]
    es_timeout_ms: u64,

    /// Port for the health and metrics endpoints.
    #[arg(long, default_value_t = 8080, env = "ESDRAIN_HTTP_PORT")]
    http_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish(),
    )?;

    let args = Args::parse();

    let ready = Arc::new(ReadyState::default());
    let inst = Arc::new(Instrumentation::new()?);
    let bus = Bus::new(esdrain_bus::DEFAULT_CAPACITY);

    let transport = HttpTransport::new(HttpTransportOptions {
        base_url: args.es_url.clone(),
        backoff: Backoff {
            initial: Duration::from_millis(args.es_backoff_init_ms),
            max: Duration::from_millis(args.es_backoff_max_ms),
        },
        timeout: Duration::from_millis(args.es_timeout_ms),
    })?;
    let facade = Arc::new(EsFacade::new(transport));
    ready.set_es_session_created();

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(args.aws_max_retries));
    if let Some(region) = args.aws_region.clone() {
        loader = loader.region(Region::new(region));
    }
    if let Some(profile) = &args.aws_profile {
        loader = loader.profile_name(profile);
    }
    let aws_config = loader.load().await;

    let sqs = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&aws_config),
        args.queue_url.clone(),
    ));
    let ec2 = Arc::new(Ec2Instances::new(aws_sdk_ec2::Client::new(&aws_config)));
    let asg = Arc::new(AutoScaling::new(aws_sdk_autoscaling::Client::new(
        &aws_config,
    )));
    ready.set_aws_session_created();

    let reconciler = Arc::new(Reconciler::new(ReconcilerOptions {
        facade: facade.clone(),
        bus: bus.clone(),
        poll_interval: Duration::from_secs(args.poll_interval_seconds),
        inst: inst.clone(),
    }));
    let emitter = QueueEmitter::new(QueueEmitterOptions {
        sqs,
        ec2,
        bus: bus.clone(),
        cluster_name: args.cluster_name.clone(),
        registry: esdrain_events::standard(),
        received: Some(inst.messages_received.clone()),
        deleted: Some(inst.messages_deleted.clone()),
    });
    let postponer = LifecycleActionPostponer::new(LifecycleActionPostponerOptions {
        api: asg.clone(),
        heartbeats: Some(inst.heartbeats_recorded_total.clone()),
    });

    let app = Arc::new(App::new(AppOptions {
        bus: bus.clone(),
        facade: facade.clone(),
        reconciler,
        emitter,
        postponer,
        asg,
        inst: inst.clone(),
        ready: ready.clone(),
    }));

    // Serve healthchecks and metrics.
    let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.http_port));
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "serving health and metrics");
    let health_facade = facade.clone();
    tokio::spawn(async move {
        let router = health::router(ready, inst, bus, health_facade);
        if let Err(err) = axum::serve(listener, router).await {
            error!(%err, "error serving healthchecks/metrics");
        }
    });

    let mut run_handle = {
        let app = app.clone();
        tokio::spawn(async move { app.run().await })
    };

    tokio::select! {
        result = &mut run_handle => {
            // A subsystem failed; exit non-zero for the supervisor.
            return result?;
        }
        () = shutdown_signal() => {
            info!("received termination signal");
            app.trigger_shutdown();
        }
    }

    run_handle.await??;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if cfg!(unix) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler failed");
        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler failed");

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    } else {
        let _ = tokio::signal::ctrl_c().await;
    }
}
