//! Access to the custom resources managed by the operator.
//!
//! `CrApi` is the narrow slice of the Kubernetes API the reconciler, GC and
//! gate listers need. `KubeCrApi` is the real implementation; tests use the
//! in-memory fake from `test_utils`.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{ConditionedResource, IPAddressAllocation, Subnet};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Namespaced name of a CR, the unit of reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object, `None` for objects without a namespace
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A CR kind the generic reconciler can drive
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + ConditionedResource
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Lowercase kind used for metrics labels, tag scopes and the finalizer
    const RESOURCE_TYPE: &'static str;

    /// The status sub-resource as it should be persisted
    fn status_json(&self) -> serde_json::Value;
}

impl ManagedResource for IPAddressAllocation {
    const RESOURCE_TYPE: &'static str = "ipaddressallocation";

    fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.status).unwrap_or(serde_json::Value::Null)
    }
}

impl ManagedResource for Subnet {
    const RESOURCE_TYPE: &'static str = "subnet";

    fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.status).unwrap_or(serde_json::Value::Null)
    }
}

/// Finalizer guarding backend cleanup for a kind
pub fn finalizer_name<K: ManagedResource>() -> String {
    format!("{}.crd.nsx.vmware.com/finalizer", K::RESOURCE_TYPE)
}

/// True if the object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// CR operations used by the engine
#[async_trait]
pub trait CrApi<K>: Send + Sync {
    /// Fetch a CR, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError>;

    /// All CRs of the kind across namespaces
    async fn list(&self) -> Result<Vec<K>, ControllerError>;

    /// CRs of the kind in one namespace
    async fn list_namespaced(&self, namespace: &str) -> Result<Vec<K>, ControllerError>;

    /// Persist the status sub-resource only
    async fn update_status(&self, obj: &K) -> Result<(), ControllerError>;

    async fn add_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError>;

    async fn remove_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError>;
}

/// `CrApi` backed by the Kubernetes API server
pub struct KubeCrApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeCrApi<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K: ManagedResource> KubeCrApi<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<(), ControllerError> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} has no namespace", obj.name_any())))?;
        // resourceVersion makes the merge patch fail on a concurrent finalizer change
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": obj.resource_version(),
            }
        });
        self.api(&namespace)
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

impl<K> fmt::Debug for KubeCrApi<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeCrApi").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: ManagedResource> CrApi<K> for KubeCrApi<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<K>, ControllerError> {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaced(&self, namespace: &str) -> Result<Vec<K>, ControllerError> {
        Ok(self.api(namespace).list(&ListParams::default()).await?.items)
    }

    async fn update_status(&self, obj: &K) -> Result<(), ControllerError> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} has no namespace", obj.name_any())))?;
        let patch = serde_json::json!({ "status": obj.status_json() });
        self.api(&namespace)
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError> {
        if has_finalizer(obj, finalizer) {
            return Ok(());
        }
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(obj, finalizers).await
    }

    async fn remove_finalizer(&self, obj: &K, finalizer: &str) -> Result<(), ControllerError> {
        if !has_finalizer(obj, finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = obj.finalizers().iter().filter(|f| *f != finalizer).cloned().collect();
        self.patch_finalizers(obj, finalizers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_ip_allocation;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("ns-1", "alloc").to_string(), "ns-1/alloc");
    }

    #[test]
    fn test_object_key_from_resource() {
        let alloc = create_test_ip_allocation("ns-1", "alloc", "uid-1");
        assert_eq!(ObjectKey::from_resource(&alloc), Some(ObjectKey::new("ns-1", "alloc")));
    }

    #[test]
    fn test_finalizer_names() {
        assert_eq!(
            finalizer_name::<IPAddressAllocation>(),
            "ipaddressallocation.crd.nsx.vmware.com/finalizer"
        );
        assert_eq!(finalizer_name::<Subnet>(), "subnet.crd.nsx.vmware.com/finalizer");
    }

    #[test]
    fn test_has_finalizer() {
        let mut alloc = create_test_ip_allocation("ns-1", "alloc", "uid-1");
        let fin = finalizer_name::<IPAddressAllocation>();
        assert!(!has_finalizer(&alloc, &fin));
        alloc.metadata.finalizers = Some(vec![fin.clone()]);
        assert!(has_finalizer(&alloc, &fin));
    }
}
