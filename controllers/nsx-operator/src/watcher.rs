//! Kubernetes resource watchers.
//!
//! Each managed kind runs a `kube_runtime::Controller` that feeds keys into
//! its `GenericReconciler`, plus a deletion watcher for CRs removed without
//! going through the finalizer. Keys requeued by the network-mode gate are
//! merged into the controller through `reconcile_on`.
//!
//! Namespace and default-network watch events are turned into
//! `NetworkEvent`s with old/new payloads and handed to the gate.

use crate::error::ControllerError;
use crate::network_mode::{DefaultNetworkInfo, NamespaceInfo, NetworkEvent, NetworkModeGate};
use crate::reconciler::{GenericReconciler, ReconcileOutcome};
use crate::resource::{ManagedResource, ObjectKey};
use crds::Network;
use futures::channel::mpsc::UnboundedReceiver;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher::{self, Event};
use kube_runtime::{
    controller::{Action, Config as ControllerConfig},
    Controller, WatchStreamExt,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Requeue delay when an error escapes the reconciler itself
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared context handed to every reconcile of one kind
pub struct WatchContext<K: ManagedResource> {
    reconciler: Arc<GenericReconciler<K>>,
    shutdown: CancellationToken,
}

async fn reconcile<K: ManagedResource>(obj: Arc<K>, ctx: Arc<WatchContext<K>>) -> Result<Action, ControllerError> {
    let Some(key) = ObjectKey::from_resource(obj.as_ref()) else {
        warn!("Ignoring {} without namespace or name", K::RESOURCE_TYPE);
        return Ok(Action::await_change());
    };
    let outcome = ctx.reconciler.reconcile(&key, &ctx.shutdown.child_token()).await?;
    Ok(match ctx.reconciler.requeue_after(&key, outcome) {
        Some(delay) => {
            debug!("Requeueing {} {} in {:?}", K::RESOURCE_TYPE, key, delay);
            Action::requeue(delay)
        }
        None => Action::await_change(),
    })
}

fn error_policy<K: ManagedResource>(obj: Arc<K>, error: &ControllerError, ctx: Arc<WatchContext<K>>) -> Action {
    error!("Reconciliation error for {} {}: {}", K::RESOURCE_TYPE, obj.name_any(), error);
    ObjectKey::from_resource(obj.as_ref())
        .and_then(|key| {
            ctx.reconciler
                .requeue_after(&key, ReconcileOutcome::Requeue(error.retry_class()))
        })
        .map_or_else(|| Action::requeue(ERROR_REQUEUE), Action::requeue)
}

/// Object references for keys the network-mode gate requeued
pub fn requeue_refs<K: ManagedResource>(
    requeue: UnboundedReceiver<ObjectKey>,
) -> impl Stream<Item = ObjectRef<K>> + Send + 'static {
    requeue.map(|key| ObjectRef::<K>::new(&key.name).within(&key.namespace))
}

/// Run the controller for one kind until `shutdown` fires.
///
/// `requeue` carries keys the network-mode gate wants reconciled again.
pub async fn watch_resource<K: ManagedResource>(
    api: Api<K>,
    reconciler: Arc<GenericReconciler<K>>,
    requeue: UnboundedReceiver<ObjectKey>,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting {} watcher", K::RESOURCE_TYPE);

    let requeue = requeue_refs::<K>(requeue);
    let ctx = Arc::new(WatchContext {
        reconciler,
        shutdown: shutdown.clone(),
    });

    Controller::new(api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .reconcile_on(requeue)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", K::RESOURCE_TYPE, obj.name),
                Err(e) => debug!("Controller error for {}: {}", K::RESOURCE_TYPE, e),
            }
        })
        .await;

    info!("{} watcher stopped", K::RESOURCE_TYPE);
    Ok(())
}

/// Reconcile CRs that disappear without passing through the finalizer
pub async fn watch_deletions<K: ManagedResource>(
    api: Api<K>,
    reconciler: Arc<GenericReconciler<K>>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    let deletions = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .try_filter_map(|event| async move {
            Ok(match event {
                Event::Delete(obj) => ObjectKey::from_resource(&obj),
                _ => None,
            })
        });

    pump(deletions, shutdown.clone(), |key: ObjectKey| {
        let reconciler = Arc::clone(&reconciler);
        let cancel = shutdown.child_token();
        async move {
            debug!("{} {} deleted", K::RESOURCE_TYPE, key);
            match reconciler.reconcile(&key, &cancel).await {
                Ok(outcome) => {
                    if let Some(delay) = reconciler.requeue_after(&key, outcome) {
                        warn!("Cleanup of deleted {} {} incomplete, GC will retry (backoff {:?})", K::RESOURCE_TYPE, key, delay);
                    }
                }
                Err(e) => warn!("Cleanup of deleted {} {} failed: {}", K::RESOURCE_TYPE, key, e),
            }
        }
    })
    .await;
    Ok(())
}

// Drive a watch stream until it ends or `shutdown` fires
async fn pump<S, T, F, Fut>(stream: S, shutdown: CancellationToken, mut handle: F)
where
    S: Stream<Item = Result<T, watcher::Error>>,
    F: FnMut(T) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(value)) => handle(value).await,
                Some(Err(e)) => warn!("Watch error: {}", e),
                None => break,
            },
        }
    }
}

/// Turns namespace watch events into `NetworkEvent`s with the previous state
#[derive(Debug, Default)]
pub struct NamespaceTracker {
    known: HashMap<String, NamespaceInfo>,
    // Names seen during an in-progress re-list
    relisting: Option<HashSet<String>>,
}

impl NamespaceTracker {
    pub fn handle(&mut self, event: Event<Namespace>) -> Vec<NetworkEvent> {
        match event {
            Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(ns) => {
                let info = NamespaceInfo::from(&ns);
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(info.name.clone());
                }
                self.apply(info).into_iter().collect()
            }
            Event::InitDone => {
                let seen = self.relisting.take().unwrap_or_default();
                let gone: Vec<String> = self.known.keys().filter(|n| !seen.contains(*n)).cloned().collect();
                gone.into_iter().filter_map(|name| self.remove(&name)).collect()
            }
            Event::Apply(ns) => self.apply(NamespaceInfo::from(&ns)).into_iter().collect(),
            Event::Delete(ns) => self.remove(&ns.name_any()).into_iter().collect(),
        }
    }

    fn apply(&mut self, new: NamespaceInfo) -> Option<NetworkEvent> {
        let old = self.known.insert(new.name.clone(), new.clone());
        if old.as_ref() == Some(&new) {
            return None;
        }
        Some(NetworkEvent::Namespace { old, new: Some(new) })
    }

    fn remove(&mut self, name: &str) -> Option<NetworkEvent> {
        let old = self.known.remove(name)?;
        Some(NetworkEvent::Namespace { old: Some(old), new: None })
    }
}

/// Tracks the effective default `Network` and reports when it changes.
///
/// The effective default is the single `Network` annotated as default;
/// none or several count as no default.
#[derive(Debug)]
pub struct DefaultNetworkTracker {
    namespace: String,
    defaults: BTreeMap<String, DefaultNetworkInfo>,
    effective: Option<DefaultNetworkInfo>,
    relisting: Option<BTreeMap<String, DefaultNetworkInfo>>,
}

impl DefaultNetworkTracker {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            defaults: BTreeMap::new(),
            effective: None,
            relisting: None,
        }
    }

    fn info(&self, network: &Network) -> Option<DefaultNetworkInfo> {
        network.is_default().then(|| DefaultNetworkInfo {
            namespace: self.namespace.clone(),
            name: network.name_any(),
            network_type: network.spec.network_type,
        })
    }

    pub fn handle(&mut self, event: Event<Network>) -> Option<NetworkEvent> {
        match event {
            Event::Init => {
                self.relisting = Some(BTreeMap::new());
                return None;
            }
            Event::InitApply(network) => {
                let info = self.info(&network);
                if let (Some(relisting), Some(info)) = (self.relisting.as_mut(), info) {
                    relisting.insert(info.name.clone(), info);
                }
                return None;
            }
            Event::InitDone => {
                self.defaults = self.relisting.take().unwrap_or_default();
            }
            Event::Apply(network) => match self.info(&network) {
                Some(info) => {
                    self.defaults.insert(info.name.clone(), info);
                }
                None => {
                    self.defaults.remove(&network.name_any());
                }
            },
            Event::Delete(network) => {
                self.defaults.remove(&network.name_any());
            }
        }

        let effective = match self.defaults.len() {
            1 => self.defaults.values().next().cloned(),
            0 => None,
            n => {
                warn!("{} networks are annotated as default in {}", n, self.namespace);
                None
            }
        };
        if effective == self.effective {
            return None;
        }
        let old = std::mem::replace(&mut self.effective, effective.clone());
        Some(NetworkEvent::DefaultNetwork { old, new: effective })
    }
}

async fn dispatch(gate: &NetworkModeGate, event: NetworkEvent) {
    debug!("Network event: {:?}", event);
    match gate.handle_event(event).await {
        Ok(0) => {}
        Ok(n) => info!("Requeued {} resources after network mode change", n),
        Err(e) => error!("Failed to handle network event: {}", e),
    }
}

/// Feed namespace changes to the gate
pub async fn watch_namespaces(
    api: Api<Namespace>,
    gate: Arc<NetworkModeGate>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting Namespace watcher");
    let mut tracker = NamespaceTracker::default();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    pump(stream, shutdown, |event| {
        let events = tracker.handle(event);
        let gate = Arc::clone(&gate);
        async move {
            for event in events {
                dispatch(&gate, event).await;
            }
        }
    })
    .await;
    Ok(())
}

/// Feed default-network changes to the gate
pub async fn watch_default_network(
    api: Api<Network>,
    namespace: String,
    gate: Arc<NetworkModeGate>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting default Network watcher in {}", namespace);
    let mut tracker = DefaultNetworkTracker::new(namespace);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    pump(stream, shutdown, |event| {
        let event = tracker.handle(event);
        let gate = Arc::clone(&gate);
        async move {
            if let Some(event) = event {
                dispatch(&gate, event).await;
            }
        }
    })
    .await;
    Ok(())
}
