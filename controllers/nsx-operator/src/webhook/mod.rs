//! Validating Admission Webhook
//!
//! Rejects CR mutations that break invariants a schema cannot express:
//! immutable fields, single-IP allocations, one binding per interface and
//! deleting objects that are still referenced.
//!
//! Each kind has a typed `Validator`. The router decodes the
//! `AdmissionReview`, hands the typed old/new objects to the validator and
//! turns its `Verdict` into the review response:
//! - POST /validate/ipaddressallocation
//! - POST /validate/addressbinding
//! - POST /validate/subnet

pub mod address_binding;
pub mod ip_address_allocation;
pub mod subnet;

pub use address_binding::AddressBindingValidator;
pub use ip_address_allocation::IpAddressAllocationValidator;
pub use subnet::SubnetValidator;

use crate::error::ControllerError;
use crate::metrics::Metrics;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use crds::{AddressBinding, IPAddressAllocation};
use k8s_openapi::api::core::v1::Service;
use kube::api::{DynamicObject, ListParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of validating one admission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
    /// The request could not be evaluated (HTTP-style status code)
    Errored(u16, String),
}

impl Verdict {
    fn label(&self) -> &'static str {
        match self {
            Verdict::Allow => "allowed",
            Verdict::Deny(_) => "denied",
            Verdict::Errored(..) => "errored",
        }
    }
}

impl From<ControllerError> for Verdict {
    fn from(err: ControllerError) -> Self {
        Verdict::Errored(500, err.to_string())
    }
}

/// Validation rules for one kind
#[async_trait]
pub trait Validator: Send + Sync {
    type Object: DeserializeOwned + Send + Sync;

    /// Lowercase kind, used in the route and metrics
    fn resource_type(&self) -> &'static str;

    async fn validate(
        &self,
        operation: Operation,
        old: Option<Self::Object>,
        new: Option<Self::Object>,
    ) -> Verdict;
}

/// Type-erased validator the router dispatches to
#[async_trait]
pub trait ReviewHandler: Send + Sync {
    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Verdict;
}

fn decode<T: DeserializeOwned>(obj: Option<&DynamicObject>) -> Result<Option<T>, Verdict> {
    obj.map(|o| {
        serde_json::to_value(o)
            .and_then(serde_json::from_value)
            .map_err(|e| Verdict::Errored(400, format!("decoding object: {}", e)))
    })
    .transpose()
}

#[async_trait]
impl<V: Validator> ReviewHandler for V {
    async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> Verdict {
        let old = match decode::<V::Object>(req.old_object.as_ref()) {
            Ok(old) => old,
            Err(verdict) => return verdict,
        };
        let new = match decode::<V::Object>(req.object.as_ref()) {
            Ok(new) => new,
            Err(verdict) => return verdict,
        };
        self.validate(req.operation.clone(), old, new).await
    }
}

/// A Service and the load balancer IPs it uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIps {
    pub name: String,
    pub ips: Vec<String>,
}

impl From<&Service> for ServiceIps {
    fn from(svc: &Service) -> Self {
        let mut ips: Vec<String> = svc
            .spec
            .as_ref()
            .and_then(|s| s.load_balancer_ip.clone())
            .into_iter()
            .collect();
        ips.extend(
            svc.status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|i| i.ip.clone()),
        );
        Self {
            name: svc.name_any(),
            ips,
        }
    }
}

/// Cross-resource reads the validators need
#[async_trait]
pub trait AdmissionLookup: Send + Sync {
    async fn get_ip_allocation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressAllocation>, ControllerError>;

    async fn list_address_bindings(&self, namespace: &str) -> Result<Vec<AddressBinding>, ControllerError>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceIps>, ControllerError>;
}

/// `AdmissionLookup` backed by the Kubernetes API, each call bounded by `timeout`
pub struct KubeAdmissionLookup {
    client: Client,
    timeout: Duration,
}

impl KubeAdmissionLookup {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ControllerError::Timeout(self.timeout.as_secs()))?
            .map_err(ControllerError::from)
    }
}

#[async_trait]
impl AdmissionLookup for KubeAdmissionLookup {
    async fn get_ip_allocation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressAllocation>, ControllerError> {
        let api: Api<IPAddressAllocation> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name)).await
    }

    async fn list_address_bindings(&self, namespace: &str) -> Result<Vec<AddressBinding>, ControllerError> {
        let api: Api<AddressBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(self.bounded(api.list(&ListParams::default())).await?.items)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceIps>, ControllerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(self
            .bounded(api.list(&ListParams::default()))
            .await?
            .items
            .iter()
            .map(ServiceIps::from)
            .collect())
    }
}

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    handlers: HashMap<&'static str, Arc<dyn ReviewHandler>>,
    metrics: Arc<Metrics>,
}

impl WebhookState {
    /// State with the validators for every kind
    pub fn new(lookup: Arc<dyn AdmissionLookup>, metrics: Arc<Metrics>) -> Self {
        Self::with_metrics(metrics)
            .register(IpAddressAllocationValidator::new(Arc::clone(&lookup)))
            .register(AddressBindingValidator::new(Arc::clone(&lookup)))
            .register(SubnetValidator)
    }

    fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            handlers: HashMap::new(),
            metrics,
        }
    }

    fn register<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.handlers.insert(validator.resource_type(), Arc::new(validator));
        self
    }
}

/// Create the webhook router with all validation endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate/{resource}", post(validate_handler))
        .with_state(state)
}

async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Path(resource): Path<String>,
    body: Bytes,
) -> Response {
    let Some(handler) = state.handlers.get(resource.as_str()) else {
        return (StatusCode::NOT_FOUND, format!("no validator for {}", resource)).into_response();
    };

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            warn!("Failed to decode admission review for {}: {}", resource, e);
            state.metrics.inc_admission(&resource, "errored");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review()).into_response();
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("Admission review for {} carries no request: {}", resource, e);
            state.metrics.inc_admission(&resource, "errored");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review()).into_response();
        }
    };

    let verdict = handler.review(&req).await;
    state.metrics.inc_admission(&resource, verdict.label());
    let namespace = req.namespace.as_deref().unwrap_or_default();
    let mut response = AdmissionResponse::from(&req);
    match verdict {
        Verdict::Allow => debug!("Allowed {:?} of {} {}/{}", req.operation, resource, namespace, req.name),
        Verdict::Deny(message) => {
            info!("Denied {:?} of {} {}/{}: {}", req.operation, resource, namespace, req.name, message);
            response = response.deny(message);
            response.result.code = 403;
        }
        Verdict::Errored(code, message) => {
            error!("Error validating {} {}/{}: {}", resource, namespace, req.name, message);
            response = response.deny(message);
            response.result.code = code;
        }
    }
    Json(response.into_review()).into_response()
}

/// Serve the webhook over TLS (`tls.crt`/`tls.key` in `cert_dir`) until `shutdown` fires
pub async fn serve_webhook(
    addr: SocketAddr,
    cert_dir: &FsPath,
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let tls_config = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|e| ControllerError::Server(format!("TLS config error: {}", e)))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!("Admission webhook listening on {}", addr);
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| ControllerError::Server(format!("webhook server error: {}", e)))
}

/// Shorthand for the immutable-field denial
pub(crate) fn immutable(field: &str) -> Verdict {
    Verdict::Deny(format!("{} is immutable", field))
}
