//! Prometheus metrics and probe endpoints.
//!
//! One counter per {kind x operation x outcome}, labelled by `res_type`.
//! The registry is owned by `Metrics` and shared through an `Arc`.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{opts, Encoder, IntCounterVec, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const NAMESPACE: &str = "nsx_operator";

/// Reconciler counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCounter {
    Sync,
    Update,
    UpdateSuccess,
    UpdateFail,
    Delete,
    DeleteSuccess,
    DeleteFail,
}

/// Operator metrics registry
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    sync_total: IntCounterVec,
    update_total: IntCounterVec,
    update_success_total: IntCounterVec,
    update_fail_total: IntCounterVec,
    delete_total: IntCounterVec,
    delete_success_total: IntCounterVec,
    delete_fail_total: IntCounterVec,
    gc_deleted_total: IntCounterVec,
    admission_total: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(opts!(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let res = &["res_type"];
        Ok(Self {
            sync_total: counter(&registry, "controller_sync_total", "Reconciliations started", res)?,
            update_total: counter(&registry, "controller_update_total", "Create-or-update attempts", res)?,
            update_success_total: counter(
                &registry,
                "controller_update_success_total",
                "Successful create-or-update operations",
                res,
            )?,
            update_fail_total: counter(
                &registry,
                "controller_update_fail_total",
                "Failed create-or-update operations",
                res,
            )?,
            delete_total: counter(&registry, "controller_delete_total", "Delete attempts", res)?,
            delete_success_total: counter(
                &registry,
                "controller_delete_success_total",
                "Successful delete operations",
                res,
            )?,
            delete_fail_total: counter(&registry, "controller_delete_fail_total", "Failed delete operations", res)?,
            gc_deleted_total: counter(
                &registry,
                "gc_deleted_total",
                "Orphaned backend objects deleted by garbage collection",
                res,
            )?,
            admission_total: counter(
                &registry,
                "admission_total",
                "Admission reviews by verdict",
                &["res_type", "verdict"],
            )?,
            registry,
        })
    }

    fn vec(&self, counter: ControllerCounter) -> &IntCounterVec {
        match counter {
            ControllerCounter::Sync => &self.sync_total,
            ControllerCounter::Update => &self.update_total,
            ControllerCounter::UpdateSuccess => &self.update_success_total,
            ControllerCounter::UpdateFail => &self.update_fail_total,
            ControllerCounter::Delete => &self.delete_total,
            ControllerCounter::DeleteSuccess => &self.delete_success_total,
            ControllerCounter::DeleteFail => &self.delete_fail_total,
        }
    }

    pub fn inc(&self, counter: ControllerCounter, res_type: &str) {
        self.vec(counter).with_label_values(&[res_type]).inc();
    }

    /// Current value of a reconciler counter
    pub fn get(&self, counter: ControllerCounter, res_type: &str) -> u64 {
        self.vec(counter).with_label_values(&[res_type]).get()
    }

    pub fn inc_gc_deleted(&self, res_type: &str) {
        self.gc_deleted_total.with_label_values(&[res_type]).inc();
    }

    pub fn gc_deleted(&self, res_type: &str) -> u64 {
        self.gc_deleted_total.with_label_values(&[res_type]).get()
    }

    pub fn inc_admission(&self, res_type: &str, verdict: &str) {
        self.admission_total.with_label_values(&[res_type, verdict]).inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct ProbeState {
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
}

/// Router serving `/metrics`, `/healthz` and `/readyz`
pub fn metrics_routes(metrics: Arc<Metrics>, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness))
        .with_state(ProbeState { metrics, ready })
}

async fn render_metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}

async fn readiness(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve metrics and probes until `shutdown` fires
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Server(format!("binding metrics address {}: {}", addr, e)))?;
    info!("Metrics server listening on {}", addr);
    axum::serve(listener, metrics_routes(metrics, ready))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!("Metrics server error: {}", e);
            ControllerError::Server(e.to_string())
        })
}
