//! Network-mode gate.
//!
//! Decides per namespace whether the VPC network stack is enabled, and so
//! whether the operator may touch CRs in it at all. Regular namespaces opt in
//! through an annotation. System namespaces have no setting of their own and
//! follow the cluster default `Network`.
//!
//! Verdicts are cached. Namespace and default-network watch events arrive as
//! `NetworkEvent`s, invalidate the cache and requeue every CR of every
//! registered controller in namespaces that became enabled.

use crate::error::ControllerError;
use crate::reconciler::ReconcileOutcome;
use crate::resource::{CrApi, ManagedResource, ObjectKey};
use async_trait::async_trait;
use crds::{Network, NetworkType};
use futures::channel::mpsc::UnboundedSender;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Label marking a system namespace that follows the default network
pub const LABEL_SYSTEM_NAMESPACE: &str = "vmware-system-shared-t1";

/// Annotation enabling the VPC stack on a regular namespace
pub const ANNOTATION_VPC_NETWORK_CONFIG: &str = "nsx.vmware.com/vpc_network_config";

/// Per-namespace state of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Unknown,
    Disabled,
    Enabled,
}

/// The parts of a namespace the gate looks at
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NamespaceInfo {
    pub fn is_system(&self) -> bool {
        self.labels.contains_key(LABEL_SYSTEM_NAMESPACE)
    }

    pub fn has_vpc_config(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_VPC_NETWORK_CONFIG)
    }
}

impl From<&Namespace> for NamespaceInfo {
    fn from(ns: &Namespace) -> Self {
        Self {
            name: ns.name_any(),
            labels: ns.labels().clone(),
            annotations: ns.annotations().clone(),
        }
    }
}

/// A `Network` annotated as the cluster default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultNetworkInfo {
    pub namespace: String,
    pub name: String,
    pub network_type: NetworkType,
}

/// Watch events the gate reacts to, each with typed old/new payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Namespace {
        old: Option<NamespaceInfo>,
        new: Option<NamespaceInfo>,
    },
    DefaultNetwork {
        old: Option<DefaultNetworkInfo>,
        new: Option<DefaultNetworkInfo>,
    },
}

/// Source of namespace and default-network state
#[async_trait]
pub trait NamespaceSource: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ControllerError>;

    /// Every `Network` annotated as default in the default-network namespace
    async fn list_default_networks(&self) -> Result<Vec<DefaultNetworkInfo>, ControllerError>;

    /// Names of all system namespaces
    async fn list_system_namespaces(&self) -> Result<Vec<String>, ControllerError>;
}

/// `NamespaceSource` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeNamespaceSource {
    client: Client,
    default_network_namespace: String,
}

impl std::fmt::Debug for KubeNamespaceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNamespaceSource")
            .field("default_network_namespace", &self.default_network_namespace)
            .finish_non_exhaustive()
    }
}

impl KubeNamespaceSource {
    pub fn new(client: Client, default_network_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_network_namespace: default_network_namespace.into(),
        }
    }
}

#[async_trait]
impl NamespaceSource for KubeNamespaceSource {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.as_ref().map(NamespaceInfo::from))
    }

    async fn list_default_networks(&self) -> Result<Vec<DefaultNetworkInfo>, ControllerError> {
        let api: Api<Network> = Api::namespaced(self.client.clone(), &self.default_network_namespace);
        Ok(api
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|n| n.is_default())
            .map(|n| DefaultNetworkInfo {
                namespace: self.default_network_namespace.clone(),
                name: n.name_any(),
                network_type: n.spec.network_type,
            })
            .collect())
    }

    async fn list_system_namespaces(&self) -> Result<Vec<String>, ControllerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(LABEL_SYSTEM_NAMESPACE);
        Ok(api.list(&params).await?.items.iter().map(|n| n.name_any()).collect())
    }
}

/// Lists the CR keys a controller has in a namespace
#[async_trait]
pub trait KeyLister: Send + Sync {
    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>, ControllerError>;
}

/// `KeyLister` over any `CrApi`
pub struct CrKeyLister<K> {
    api: Arc<dyn CrApi<K>>,
}

impl<K> CrKeyLister<K> {
    pub fn new(api: Arc<dyn CrApi<K>>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<K: ManagedResource> KeyLister for CrKeyLister<K> {
    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>, ControllerError> {
        Ok(self
            .api
            .list_namespaced(namespace)
            .await?
            .iter()
            .filter_map(ObjectKey::from_resource)
            .collect())
    }
}

/// A downstream controller registered for requeue on gate changes
pub struct Requeuer {
    pub resource_name: &'static str,
    pub lister: Arc<dyn KeyLister>,
    pub sender: UnboundedSender<ObjectKey>,
}

/// Per-namespace network-mode gate
pub struct NetworkModeGate {
    source: Arc<dyn NamespaceSource>,
    cache: RwLock<HashMap<String, bool>>,
    system_network_namespaces: RwLock<HashSet<String>>,
    requeuers: RwLock<Vec<Requeuer>>,
}

impl std::fmt::Debug for NetworkModeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkModeGate")
            .field("cache", &self.cache)
            .field("system_network_namespaces", &self.system_network_namespaces)
            .finish_non_exhaustive()
    }
}

impl NetworkModeGate {
    pub fn new(source: Arc<dyn NamespaceSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            system_network_namespaces: RwLock::new(HashSet::new()),
            requeuers: RwLock::new(Vec::new()),
        }
    }

    /// Register a controller to be requeued when namespaces become enabled
    pub fn register(&self, requeuer: Requeuer) {
        info!("Registering {} for network-mode requeue", requeuer.resource_name);
        self.requeuers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(requeuer);
    }

    /// Current cached state of a namespace
    pub fn mode(&self, namespace: &str) -> NetworkMode {
        match self.cached(namespace) {
            None => NetworkMode::Unknown,
            Some(true) => NetworkMode::Enabled,
            Some(false) => NetworkMode::Disabled,
        }
    }

    /// System namespaces currently following an enabled default network
    pub fn system_network_namespaces(&self) -> HashSet<String> {
        self.system_network_namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cached(&self, namespace: &str) -> Option<bool> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .copied()
    }

    fn invalidate(&self, namespace: &str) -> Option<bool> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
    }

    /// Whether the VPC stack is enabled in `namespace`
    pub async fn is_enabled(&self, namespace: &str) -> Result<bool, ControllerError> {
        if let Some(enabled) = self.cached(namespace) {
            return Ok(enabled);
        }

        let Some(info) = self.source.get_namespace(namespace).await? else {
            debug!("Namespace {} not found, treating as disabled", namespace);
            return Ok(false);
        };

        let enabled = if info.is_system() {
            let enabled = self.default_network_enabled().await?;
            let mut system = self
                .system_network_namespaces
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if enabled {
                system.insert(namespace.to_string());
            } else {
                system.remove(namespace);
            }
            enabled
        } else {
            info.has_vpc_config()
        };

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace.to_string(), enabled);
        Ok(enabled)
    }

    async fn default_network_enabled(&self) -> Result<bool, ControllerError> {
        let defaults = self.source.list_default_networks().await?;
        match defaults.as_slice() {
            [] => Ok(false),
            [single] => Ok(single.network_type == NetworkType::NsxtVpc),
            many => Err(ControllerError::MultipleDefaultNetworks(
                many.iter()
                    .map(|n| format!("{}/{}", n.namespace, n.name))
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// Run `inner` only if the key's namespace is enabled
    pub async fn reconcile_with_filters<F, Fut>(
        &self,
        resource_name: &str,
        key: &ObjectKey,
        inner: F,
    ) -> Result<ReconcileOutcome, ControllerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ReconcileOutcome, ControllerError>>,
    {
        if self.is_enabled(&key.namespace).await? {
            inner().await
        } else {
            debug!(
                "Skipping {} {}: VPC network is not enabled in namespace {}",
                resource_name, key, key.namespace
            );
            Ok(ReconcileOutcome::Normal)
        }
    }

    /// React to a namespace or default-network change.
    ///
    /// Returns the number of keys requeued.
    pub async fn handle_event(&self, event: NetworkEvent) -> Result<usize, ControllerError> {
        match event {
            NetworkEvent::Namespace { old, new } => self.on_namespace_event(old, new).await,
            NetworkEvent::DefaultNetwork { old, new } => self.on_default_network_event(old, new).await,
        }
    }

    async fn on_namespace_event(
        &self,
        old: Option<NamespaceInfo>,
        new: Option<NamespaceInfo>,
    ) -> Result<usize, ControllerError> {
        let Some(new) = new else {
            if let Some(old) = old {
                debug!("Namespace {} deleted, dropping cached network mode", old.name);
                self.invalidate(&old.name);
                self.system_network_namespaces
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&old.name);
            }
            return Ok(0);
        };

        let relevant_change = old
            .as_ref()
            .is_none_or(|o| o.is_system() != new.is_system() || o.has_vpc_config() != new.has_vpc_config());
        if !relevant_change {
            return Ok(0);
        }

        let was_enabled = self.invalidate(&new.name);
        if !new.is_system() {
            self.system_network_namespaces
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&new.name);
        }
        let enabled = self.is_enabled(&new.name).await?;
        if enabled && was_enabled != Some(true) {
            info!("VPC network enabled in namespace {}", new.name);
            return self.requeue_namespaces(std::slice::from_ref(&new.name)).await;
        }
        Ok(0)
    }

    async fn on_default_network_event(
        &self,
        old: Option<DefaultNetworkInfo>,
        new: Option<DefaultNetworkInfo>,
    ) -> Result<usize, ControllerError> {
        let old_type = old.as_ref().map(|n| n.network_type);
        let new_type = new.as_ref().map(|n| n.network_type);
        if old_type == new_type {
            return Ok(0);
        }
        info!("Default network type changed from {:?} to {:?}", old_type, new_type);

        let system_namespaces = self.source.list_system_namespaces().await?;
        {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            for ns in &system_namespaces {
                cache.remove(ns);
            }
        }
        self.system_network_namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let mut enabled = Vec::new();
        let mut failures = Vec::new();
        for ns in system_namespaces {
            match self.is_enabled(&ns).await {
                Ok(true) => enabled.push(ns),
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot evaluate network mode of namespace {}: {}", ns, e);
                    failures.push(format!("{}: {}", ns, e));
                }
            }
        }

        let requeued = self.requeue_namespaces(&enabled).await;
        match requeued {
            Ok(count) if failures.is_empty() => Ok(count),
            Ok(_) => Err(ControllerError::Requeue(failures.join("; "))),
            Err(ControllerError::Requeue(more)) => {
                failures.push(more);
                Err(ControllerError::Requeue(failures.join("; ")))
            }
            Err(e) => Err(e),
        }
    }

    async fn requeue_namespaces(&self, namespaces: &[String]) -> Result<usize, ControllerError> {
        // Snapshot so the lock is not held across list calls
        let targets: Vec<(&'static str, Arc<dyn KeyLister>, UnboundedSender<ObjectKey>)> = self
            .requeuers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (r.resource_name, Arc::clone(&r.lister), r.sender.clone()))
            .collect();

        // Every namespace is attempted; failures are reported together
        let mut requeued = 0;
        let mut failures = Vec::new();
        for namespace in namespaces {
            for (resource_name, lister, sender) in &targets {
                let keys = match lister.list_keys(namespace).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!("Cannot list {} in namespace {} for requeue: {}", resource_name, namespace, e);
                        failures.push(format!("{} in {}: {}", resource_name, namespace, e));
                        continue;
                    }
                };
                for key in keys {
                    debug!("Requeueing {} {}", resource_name, key);
                    if sender.unbounded_send(key).is_err() {
                        warn!("{} requeue channel closed", resource_name);
                        failures.push(format!("{} in {}: requeue channel closed", resource_name, namespace));
                        break;
                    }
                    requeued += 1;
                }
            }
        }

        if failures.is_empty() {
            Ok(requeued)
        } else {
            Err(ControllerError::Requeue(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeNamespaceSource, StaticKeyLister};
    use futures::channel::mpsc;
    use futures::StreamExt;

    fn gate_with(source: &FakeNamespaceSource) -> NetworkModeGate {
        NetworkModeGate::new(Arc::new(source.clone()))
    }

    fn default_network(network_type: NetworkType) -> DefaultNetworkInfo {
        DefaultNetworkInfo {
            namespace: "kube-system".to_string(),
            name: "default".to_string(),
            network_type,
        }
    }

    #[tokio::test]
    async fn test_regular_namespace_follows_annotation() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::vpc_namespace("ns-vpc"));
        source.add_namespace(FakeNamespaceSource::plain_namespace("ns-plain"));
        let gate = gate_with(&source);

        assert_eq!(gate.mode("ns-vpc"), NetworkMode::Unknown);
        assert!(gate.is_enabled("ns-vpc").await.unwrap());
        assert!(!gate.is_enabled("ns-plain").await.unwrap());
        assert!(!gate.is_enabled("ns-missing").await.unwrap());
        assert_eq!(gate.mode("ns-vpc"), NetworkMode::Enabled);
        assert_eq!(gate.mode("ns-plain"), NetworkMode::Disabled);
        assert_eq!(gate.mode("ns-missing"), NetworkMode::Unknown);
    }

    #[tokio::test]
    async fn test_verdict_is_cached() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::vpc_namespace("ns-vpc"));
        let gate = gate_with(&source);

        assert!(gate.is_enabled("ns-vpc").await.unwrap());
        source.add_namespace(FakeNamespaceSource::plain_namespace("ns-vpc"));
        assert!(gate.is_enabled("ns-vpc").await.unwrap());
        assert_eq!(source.namespace_reads(), 1);
    }

    #[tokio::test]
    async fn test_system_namespace_defers_to_default_network() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-a"));
        let gate = gate_with(&source);

        // No default network: disabled
        assert!(!gate.is_enabled("vmware-system-a").await.unwrap());

        let gate = gate_with(&source);
        source.set_default_networks(vec![default_network(NetworkType::NsxtVpc)]);
        assert!(gate.is_enabled("vmware-system-a").await.unwrap());
        assert!(gate.system_network_namespaces().contains("vmware-system-a"));

        let gate = gate_with(&source);
        source.set_default_networks(vec![default_network(NetworkType::Vsphere)]);
        assert!(!gate.is_enabled("vmware-system-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_multiple_default_networks_is_an_error() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-a"));
        let mut second = default_network(NetworkType::NsxtVpc);
        second.name = "other".to_string();
        source.set_default_networks(vec![default_network(NetworkType::NsxtVpc), second]);
        let gate = gate_with(&source);

        let err = gate.is_enabled("vmware-system-a").await.unwrap_err();
        assert!(matches!(err, ControllerError::MultipleDefaultNetworks(msg) if msg.contains("kube-system/other")));
    }

    #[tokio::test]
    async fn test_reconcile_with_filters_skips_disabled_namespace() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::plain_namespace("ns-plain"));
        let gate = gate_with(&source);

        let flag = std::sync::atomic::AtomicBool::new(false);
        let called = &flag;
        let outcome = gate
            .reconcile_with_filters("subnet", &ObjectKey::new("ns-plain", "web"), move || async move {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(ReconcileOutcome::Requeue(crate::error::RetryClass::Transient))
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Normal);
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_default_network_change_requeues_system_namespaces() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-a"));
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-b"));
        let gate = gate_with(&source);

        let (tx, mut rx) = mpsc::unbounded();
        gate.register(Requeuer {
            resource_name: "subnet",
            lister: Arc::new(StaticKeyLister::new(vec![
                ObjectKey::new("vmware-system-a", "s1"),
                ObjectKey::new("vmware-system-b", "s2"),
                ObjectKey::new("ns-other", "s3"),
            ])),
            sender: tx,
        });

        // Cached as disabled before the default network flips
        assert!(!gate.is_enabled("vmware-system-a").await.unwrap());

        source.set_default_networks(vec![default_network(NetworkType::NsxtVpc)]);
        let requeued = gate
            .handle_event(NetworkEvent::DefaultNetwork {
                old: Some(default_network(NetworkType::Nsxt)),
                new: Some(default_network(NetworkType::NsxtVpc)),
            })
            .await
            .unwrap();

        assert_eq!(requeued, 2);
        assert!(gate.is_enabled("vmware-system-a").await.unwrap());
        assert_eq!(gate.system_network_namespaces().len(), 2);
        let mut keys = vec![rx.next().await.unwrap(), rx.next().await.unwrap()];
        keys.sort();
        assert_eq!(keys[0], ObjectKey::new("vmware-system-a", "s1"));
        assert_eq!(keys[1], ObjectKey::new("vmware-system-b", "s2"));
    }

    #[tokio::test]
    async fn test_failed_requeue_does_not_stop_other_namespaces() {
        let source = FakeNamespaceSource::default();
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-a"));
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-b"));
        source.add_namespace(FakeNamespaceSource::system_namespace("vmware-system-c"));
        source.set_default_networks(vec![default_network(NetworkType::NsxtVpc)]);
        let gate = gate_with(&source);

        let (tx, mut rx) = mpsc::unbounded();
        gate.register(Requeuer {
            resource_name: "subnet",
            lister: Arc::new(
                StaticKeyLister::new(vec![
                    ObjectKey::new("vmware-system-a", "s1"),
                    ObjectKey::new("vmware-system-b", "s2"),
                    ObjectKey::new("vmware-system-c", "s3"),
                ])
                .failing_on("vmware-system-b"),
            ),
            sender: tx,
        });

        let err = gate
            .handle_event(NetworkEvent::DefaultNetwork {
                old: Some(default_network(NetworkType::Nsxt)),
                new: Some(default_network(NetworkType::NsxtVpc)),
            })
            .await
            .unwrap_err();
        assert!(matches!(&err, ControllerError::Requeue(msg) if msg.contains("vmware-system-b")));

        let mut keys = vec![rx.next().await.unwrap(), rx.next().await.unwrap()];
        keys.sort();
        assert_eq!(keys[0], ObjectKey::new("vmware-system-a", "s1"));
        assert_eq!(keys[1], ObjectKey::new("vmware-system-c", "s3"));
        assert!(rx.try_next().is_err());
    }

    #[tokio::test]
    async fn test_default_network_event_without_type_change_is_ignored() {
        let source = FakeNamespaceSource::default();
        let gate = gate_with(&source);
        let requeued = gate
            .handle_event(NetworkEvent::DefaultNetwork {
                old: Some(default_network(NetworkType::NsxtVpc)),
                new: Some(default_network(NetworkType::NsxtVpc)),
            })
            .await
            .unwrap();
        assert_eq!(requeued, 0);
        assert_eq!(source.system_namespace_lists(), 0);
    }

    #[tokio::test]
    async fn test_namespace_annotation_added_requeues_namespace() {
        let source = FakeNamespaceSource::default();
        let plain = FakeNamespaceSource::plain_namespace("ns-1");
        source.add_namespace(plain.clone());
        let gate = gate_with(&source);
        let (tx, mut rx) = mpsc::unbounded();
        gate.register(Requeuer {
            resource_name: "ipaddressallocation",
            lister: Arc::new(StaticKeyLister::new(vec![ObjectKey::new("ns-1", "alloc")])),
            sender: tx,
        });
        assert!(!gate.is_enabled("ns-1").await.unwrap());

        let vpc = FakeNamespaceSource::vpc_namespace("ns-1");
        source.add_namespace(vpc.clone());
        let requeued = gate
            .handle_event(NetworkEvent::Namespace {
                old: Some(plain),
                new: Some(vpc.clone()),
            })
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(rx.next().await.unwrap(), ObjectKey::new("ns-1", "alloc"));

        // Unrelated update: no requeue, verdict stays cached
        let mut relabeled = vpc.clone();
        relabeled.labels.insert("team".to_string(), "a".to_string());
        let requeued = gate
            .handle_event(NetworkEvent::Namespace {
                old: Some(vpc.clone()),
                new: Some(relabeled),
            })
            .await
            .unwrap();
        assert_eq!(requeued, 0);

        gate.handle_event(NetworkEvent::Namespace { old: Some(vpc), new: None })
            .await
            .unwrap();
        assert_eq!(gate.mode("ns-1"), NetworkMode::Unknown);
    }
}
