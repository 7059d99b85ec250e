//! Test utilities for unit testing reconcilers, services and webhooks
//!
//! This module provides helpers for creating test CRs and in-memory fakes
//! for every seam the engine talks through.

use crate::allocator::IpAllocator;
use crate::error::ControllerError;
use crate::network_mode::{
    DefaultNetworkInfo, KeyLister, NamespaceInfo, NamespaceSource, ANNOTATION_VPC_NETWORK_CONFIG,
    LABEL_SYSTEM_NAMESPACE,
};
use crate::realization::{RealizationPoller, RetryPolicy};
use crate::resource::{CrApi, ManagedResource, ObjectKey};
use crate::services::{CrIdentity, ResourceService, ServiceContext};
use crate::status::EventSink;
use crate::store::{ResourceStore, StoreEntry};
use crate::webhook::{AdmissionLookup, ServiceIps};
use async_trait::async_trait;
use crds::*;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use nsx_client::{MockNsxClient, NsxClientTrait, NsxError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_metadata(namespace: &str, name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(uid.to_string()),
        ..Default::default()
    }
}

/// Fixed timestamp for objects marked for deletion
pub fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap()
}

/// Helper to create a test IPAddressAllocation (Private, size 4, no status)
pub fn create_test_ip_allocation(namespace: &str, name: &str, uid: &str) -> IPAddressAllocation {
    IPAddressAllocation {
        metadata: test_metadata(namespace, name, uid),
        spec: IPAddressAllocationSpec {
            ip_address_block_visibility: IPAddressVisibility::Private,
            allocation_size: Some(4),
            allocation_ips: None,
        },
        status: None,
    }
}

/// Helper to create a test Subnet with a default spec
pub fn create_test_subnet(namespace: &str, name: &str, uid: &str) -> Subnet {
    Subnet {
        metadata: test_metadata(namespace, name, uid),
        spec: SubnetSpec::default(),
        status: None,
    }
}

/// Helper to create a test AddressBinding
pub fn create_test_address_binding(
    namespace: &str,
    name: &str,
    vm_name: &str,
    interface_name: &str,
    allocation: Option<&str>,
) -> AddressBinding {
    AddressBinding {
        metadata: test_metadata(namespace, name, &format!("uid-{}", name)),
        spec: AddressBindingSpec {
            vm_name: vm_name.to_string(),
            interface_name: interface_name.to_string(),
            ip_address_allocation_name: allocation.map(|s| s.to_string()),
        },
    }
}

/// Service context over a mock backend with small pools and fast polling
pub fn create_service_context(mock: MockNsxClient) -> ServiceContext {
    let client: Arc<dyn NsxClientTrait> = Arc::new(mock);
    let allocator = IpAllocator::new();
    allocator.add_pool("external", vec!["192.168.0.0/24".parse().unwrap()]);
    allocator.add_pool("vpc-private", vec!["10.0.0.0/24".parse().unwrap()]);
    allocator.add_pool("private-tgw", vec!["172.16.0.0/24".parse().unwrap()]);
    ServiceContext {
        poller: RealizationPoller::new(Arc::clone(&client)),
        client,
        store: Arc::new(ResourceStore::new()),
        allocator: Arc::new(allocator),
        realize_policy: RetryPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        },
        cluster: "test-cluster".to_string(),
        project: "default".to_string(),
    }
}

/// In-memory `CrApi` behaving like the API server for one kind
pub struct FakeCrApi<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    status_writes: AtomicUsize,
    list_calls: AtomicUsize,
    fail_lists: AtomicBool,
}

impl<K: ManagedResource> FakeCrApi<K> {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            status_writes: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            fail_lists: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj).unwrap();
        self.objects.lock().unwrap().insert(key, obj);
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.objects.lock().unwrap().remove(key)
    }

    /// Simulate `kubectl delete`: set the deletion timestamp, or drop the
    /// object right away if it has no finalizers
    pub fn mark_deleted(&self, key: &ObjectKey) {
        let mut objects = self.objects.lock().unwrap();
        let Some(obj) = objects.get_mut(key) else {
            return;
        };
        if obj.finalizers().is_empty() {
            objects.remove(key);
        } else {
            obj.meta_mut().deletion_timestamp = Some(deletion_time());
        }
    }

    pub fn stored(&self, key: &ObjectKey) -> Option<K> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    fn check_list(&self) -> Result<(), ControllerError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ControllerError::Watch("list failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<K: ManagedResource> CrApi<K> for FakeCrApi<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError> {
        Ok(self.stored(key))
    }

    async fn list(&self) -> Result<Vec<K>, ControllerError> {
        self.check_list()?;
        Ok(self.objects.lock().unwrap().values().cloned().collect())
    }

    async fn list_namespaced(&self, namespace: &str) -> Result<Vec<K>, ControllerError> {
        self.check_list()?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn update_status(&self, obj: &K) -> Result<(), ControllerError> {
        let key = ObjectKey::from_resource(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(ControllerError::InvalidResource(format!("{} not found", key)));
        };
        // Status writes never touch metadata
        let meta = stored.meta().clone();
        *stored = obj.clone();
        *stored.meta_mut() = meta;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError> {
        let key = ObjectKey::from_resource(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        if let Some(stored) = objects.get_mut(&key) {
            let finalizers = stored.meta_mut().finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError> {
        let key = ObjectKey::from_resource(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key) else {
            return Ok(());
        };
        if let Some(finalizers) = stored.meta_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        if stored.meta().deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            objects.remove(&key);
        }
        Ok(())
    }
}

/// Records published events
#[derive(Default)]
pub struct FakeEventSink {
    events: Mutex<Vec<(ObjectReference, EventType, String, String)>>,
}

impl FakeEventSink {
    pub fn published(&self) -> Vec<(ObjectReference, EventType, String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.2.clone()).collect()
    }
}

#[async_trait]
impl EventSink for FakeEventSink {
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: String) {
        self.events
            .lock()
            .unwrap()
            .push((reference.clone(), type_, reason.to_string(), note));
    }
}

#[derive(Default)]
struct NamespaceState {
    namespaces: HashMap<String, NamespaceInfo>,
    default_networks: Vec<DefaultNetworkInfo>,
    namespace_reads: usize,
    system_namespace_lists: usize,
}

/// In-memory `NamespaceSource`; clones share state
#[derive(Clone, Default)]
pub struct FakeNamespaceSource {
    state: Arc<Mutex<NamespaceState>>,
}

impl FakeNamespaceSource {
    /// Namespace with the VPC network annotation
    pub fn vpc_namespace(name: &str) -> NamespaceInfo {
        NamespaceInfo {
            name: name.to_string(),
            annotations: [(ANNOTATION_VPC_NETWORK_CONFIG.to_string(), "default".to_string())].into(),
            ..Default::default()
        }
    }

    pub fn plain_namespace(name: &str) -> NamespaceInfo {
        NamespaceInfo {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn system_namespace(name: &str) -> NamespaceInfo {
        NamespaceInfo {
            name: name.to_string(),
            labels: [(LABEL_SYSTEM_NAMESPACE.to_string(), "true".to_string())].into(),
            ..Default::default()
        }
    }

    /// Insert or replace a namespace
    pub fn add_namespace(&self, info: NamespaceInfo) {
        self.state.lock().unwrap().namespaces.insert(info.name.clone(), info);
    }

    pub fn set_default_networks(&self, networks: Vec<DefaultNetworkInfo>) {
        self.state.lock().unwrap().default_networks = networks;
    }

    pub fn namespace_reads(&self) -> usize {
        self.state.lock().unwrap().namespace_reads
    }

    pub fn system_namespace_lists(&self) -> usize {
        self.state.lock().unwrap().system_namespace_lists
    }
}

#[async_trait]
impl NamespaceSource for FakeNamespaceSource {
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.namespace_reads += 1;
        Ok(state.namespaces.get(name).cloned())
    }

    async fn list_default_networks(&self) -> Result<Vec<DefaultNetworkInfo>, ControllerError> {
        Ok(self.state.lock().unwrap().default_networks.clone())
    }

    async fn list_system_namespaces(&self) -> Result<Vec<String>, ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.system_namespace_lists += 1;
        let mut names: Vec<String> = state
            .namespaces
            .values()
            .filter(|ns| ns.is_system())
            .map(|ns| ns.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// `KeyLister` over a fixed key set
pub struct StaticKeyLister {
    keys: Vec<ObjectKey>,
    failing: HashSet<String>,
}

impl StaticKeyLister {
    pub fn new(keys: Vec<ObjectKey>) -> Self {
        Self {
            keys,
            failing: HashSet::new(),
        }
    }

    /// Make listing in `namespace` fail
    pub fn failing_on(mut self, namespace: &str) -> Self {
        self.failing.insert(namespace.to_string());
        self
    }
}

#[async_trait]
impl KeyLister for StaticKeyLister {
    async fn list_keys(&self, namespace: &str) -> Result<Vec<ObjectKey>, ControllerError> {
        if self.failing.contains(namespace) {
            return Err(ControllerError::Watch(format!("listing {} failed", namespace)));
        }
        Ok(self.keys.iter().filter(|k| k.namespace == namespace).cloned().collect())
    }
}

#[derive(Default)]
struct LookupState {
    allocations: Vec<IPAddressAllocation>,
    bindings: Vec<AddressBinding>,
    services: HashMap<String, Vec<ServiceIps>>,
    fail_lists: bool,
}

/// In-memory `AdmissionLookup`; clones share state
#[derive(Clone, Default)]
pub struct FakeAdmissionLookup {
    state: Arc<Mutex<LookupState>>,
}

impl FakeAdmissionLookup {
    pub fn add_allocation(&self, alloc: IPAddressAllocation) {
        self.state.lock().unwrap().allocations.push(alloc);
    }

    pub fn add_binding(&self, binding: AddressBinding) {
        self.state.lock().unwrap().bindings.push(binding);
    }

    pub fn add_service(&self, namespace: &str, service: ServiceIps) {
        self.state
            .lock()
            .unwrap()
            .services
            .entry(namespace.to_string())
            .or_default()
            .push(service);
    }

    /// Make every list call fail
    pub fn fail_lists(&self, fail: bool) {
        self.state.lock().unwrap().fail_lists = fail;
    }

    fn check_list(&self) -> Result<(), ControllerError> {
        if self.state.lock().unwrap().fail_lists {
            return Err(ControllerError::Timeout(5));
        }
        Ok(())
    }
}

#[async_trait]
impl AdmissionLookup for FakeAdmissionLookup {
    async fn get_ip_allocation(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressAllocation>, ControllerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .allocations
            .iter()
            .find(|a| a.namespace().as_deref() == Some(namespace) && a.name_any() == name)
            .cloned())
    }

    async fn list_address_bindings(&self, namespace: &str) -> Result<Vec<AddressBinding>, ControllerError> {
        self.check_list()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .filter(|b| b.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceIps>, ControllerError> {
        self.check_list()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

/// Failures `FakeService` can be told to produce on create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeError {
    /// User-actionable allocation failure
    PoolExhausted,
    /// Transient backend failure
    Unavailable,
}

/// Scriptable `ResourceService` tracking objects in a real `ResourceStore`.
///
/// `create_or_update` reports a change only the first time it sees a UID.
pub struct FakeService {
    store: Arc<ResourceStore>,
    creates: AtomicUsize,
    delete_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    create_error: Mutex<Option<FakeError>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeService {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            store,
            creates: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
            failing_deletes: Mutex::new(HashSet::new()),
            create_error: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Track a backend object for `obj` as if it had been created
    pub fn track<K: ManagedResource>(&self, obj: &K) {
        let identity = CrIdentity::from_resource(obj).unwrap();
        self.track_identity(K::RESOURCE_TYPE, &identity);
    }

    fn track_identity(&self, kind: &'static str, identity: &CrIdentity) {
        self.store.track(StoreEntry {
            uid: identity.uid.clone(),
            kind,
            key: identity.key.clone(),
            backend_path: format!("/fake/{}/{}", kind, identity.key),
            tags: Vec::new(),
        });
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// UIDs whose backend object was actually removed, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fail_delete(&self, uid: &str) {
        self.failing_deletes.lock().unwrap().insert(uid.to_string());
    }

    pub fn set_create_error(&self, error: Option<FakeError>) {
        *self.create_error.lock().unwrap() = error;
    }

    /// Make every backend call take this long
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn wait(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<K: ManagedResource> ResourceService<K> for FakeService {
    async fn create_or_update(&self, obj: &mut K) -> Result<bool, ControllerError> {
        self.wait().await;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let error = *self.create_error.lock().unwrap();
        match error {
            Some(FakeError::PoolExhausted) => {
                return Err(ControllerError::Allocation(crate::allocator::AllocatorError::PoolExhausted {
                    pool: "external".to_string(),
                    size: 4,
                }));
            }
            Some(FakeError::Unavailable) => {
                return Err(ControllerError::Nsx(NsxError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                }));
            }
            None => {}
        }
        let identity = CrIdentity::from_resource(obj)?;
        let known = self.store.lookup(&identity.uid).is_some();
        self.track_identity(K::RESOURCE_TYPE, &identity);
        Ok(!known)
    }

    async fn delete(&self, identity: &CrIdentity) -> Result<(), ControllerError> {
        self.wait().await;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_deletes.lock().unwrap().contains(&identity.uid) {
            return Err(ControllerError::Nsx(NsxError::Api {
                status: 500,
                message: "delete failed".to_string(),
            }));
        }
        if self.store.untrack(&identity.uid).is_some() {
            self.deleted.lock().unwrap().push(identity.uid.clone());
        }
        Ok(())
    }

    fn list_tracked_ids(&self) -> BTreeSet<String> {
        self.store.list_tracked_ids(K::RESOURCE_TYPE)
    }

    async fn rehydrate(&self) -> Result<usize, ControllerError> {
        Ok(0)
    }
}
