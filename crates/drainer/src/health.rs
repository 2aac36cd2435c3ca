use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use esdrain_bus::Bus;
use esdrain_es::{EsFacade, EsTransport};
use esdrain_events::BusEvent;
use prometheus::TextEncoder;
use tracing::warn;

use crate::instrumentation::Instrumentation;

/// Readiness flags flipped as subsystems come up (and down).
#[derive(Default)]
pub struct ReadyState {
    es_session_created: AtomicBool,
    aws_session_created: AtomicBool,
    polled_once: AtomicBool,
    failed: AtomicBool,
}

impl ReadyState {
    /// Marks the Elasticsearch client as constructed.
    pub fn set_es_session_created(&self) {
        self.es_session_created.store(true, Ordering::Release);
    }

    /// Marks the AWS clients as constructed.
    pub fn set_aws_session_created(&self) {
        self.aws_session_created.store(true, Ordering::Release);
    }

    /// Marks the initial cluster-state poll as done.
    pub fn set_polled_once(&self) {
        self.polled_once.store(true, Ordering::Release);
    }

    /// Marks the process as failed; readiness stays unhealthy from here on.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Whether the daemon's subsystems have come up and none has failed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
            && self.es_session_created.load(Ordering::Acquire)
            && self.aws_session_created.load(Ordering::Acquire)
            && self.polled_once.load(Ordering::Acquire)
    }
}

struct HttpState<T> {
    ready: Arc<ReadyState>,
    inst: Arc<Instrumentation>,
    bus: Bus<BusEvent>,
    facade: Arc<EsFacade<T>>,
}

impl<T> Clone for HttpState<T> {
    fn clone(&self) -> Self {
        Self {
            ready: self.ready.clone(),
            inst: self.inst.clone(),
            bus: self.bus.clone(),
            facade: self.facade.clone(),
        }
    }
}

/// Builds the health/metrics router.
///
/// `/readyz` combines the subsystem flags with a live cluster-health call,
/// so a daemon whose Elasticsearch became unreachable reads as not ready.
#[must_use]
pub fn router<T: EsTransport>(
    ready: Arc<ReadyState>,
    inst: Arc<Instrumentation>,
    bus: Bus<BusEvent>,
    facade: Arc<EsFacade<T>>,
) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz::<T>))
        .route("/metrics", get(metrics::<T>))
        .with_state(HttpState {
            ready,
            inst,
            bus,
            facade,
        })
}

async fn livez() -> &'static str {
    "ok"
}

async fn readyz<T: EsTransport>(State(state): State<HttpState<T>>) -> impl IntoResponse {
    if !state.ready.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready");
    }
    match state.facade.cluster_health().await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "readiness check failed to reach elasticsearch");
            (StatusCode::SERVICE_UNAVAILABLE, "elasticsearch unreachable")
        }
    }
}

async fn metrics<T: EsTransport>(State(state): State<HttpState<T>>) -> impl IntoResponse {
    state
        .inst
        .bus_dropped_deliveries
        .set(i64::try_from(state.bus.dropped()).unwrap_or(i64::MAX));

    TextEncoder::new()
        .encode_to_string(&state.inst.registry().gather())
        .map_or_else(
            |e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            |body| (StatusCode::OK, body),
        )
}
