//! Resource-specific services.
//!
//! A service turns one CR kind into NSX policy objects: it allocates
//! addresses, PATCHes the backend, waits for realization and keeps the
//! resource store current. The generic reconciler and the garbage collector
//! only talk to services through `ResourceService`.

pub mod ip_address_allocation;
pub mod subnet;

pub use ip_address_allocation::IpAddressAllocationService;
pub use subnet::SubnetService;

use crate::allocator::IpAllocator;
use crate::error::ControllerError;
use crate::realization::{RealizationPoller, RetryPolicy};
use crate::resource::ObjectKey;
use crate::store::{ResourceStore, StoreEntry};
use async_trait::async_trait;
use kube::Resource;
use nsx_client::{NsxClientTrait, PolicyObject, Tag};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Tag scope holding the cluster name
pub const TAG_SCOPE_CLUSTER: &str = "nsx-op/cluster";
/// Tag scope holding the CR namespace
pub const TAG_SCOPE_NAMESPACE: &str = "nsx-op/namespace";

/// Correlation tag scope for a kind
pub fn uid_scope(resource_type: &str) -> String {
    format!("nsx-op/{}_uid", resource_type)
}

pub fn name_scope(resource_type: &str) -> String {
    format!("nsx-op/{}_name", resource_type)
}

/// Identity of a CR that survives the CR body being gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrIdentity {
    pub uid: String,
    pub key: ObjectKey,
}

impl CrIdentity {
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, ControllerError> {
        let key = ObjectKey::from_resource(obj)
            .ok_or_else(|| ControllerError::InvalidResource("object has no namespace or name".to_string()))?;
        let uid = obj
            .meta()
            .uid
            .clone()
            .ok_or_else(|| ControllerError::InvalidResource(format!("{} has no UID", key)))?;
        Ok(Self { uid, key })
    }

    pub fn from_entry(entry: &StoreEntry) -> Self {
        Self {
            uid: entry.uid.clone(),
            key: entry.key.clone(),
        }
    }
}

/// Deterministic backend ID: a retried create PATCHes the same object
pub fn backend_id(identity: &CrIdentity) -> String {
    let prefix: String = identity.uid.chars().take(8).collect();
    format!("{}_{}", identity.key.name, prefix)
}

/// Operations the engine needs from a resource-specific service
#[async_trait]
pub trait ResourceService<K>: Send + Sync {
    /// Drive the backend to the CR's desired state; returns true if anything changed
    async fn create_or_update(&self, obj: &mut K) -> Result<bool, ControllerError>;

    /// Delete the backend object owned by a CR and release what it holds
    async fn delete(&self, identity: &CrIdentity) -> Result<(), ControllerError>;

    /// UIDs of CRs this service tracks backend objects for
    fn list_tracked_ids(&self) -> BTreeSet<String>;

    /// Rebuild the store and allocator from backend objects; returns the count found
    async fn rehydrate(&self) -> Result<usize, ControllerError>;
}

/// Collaborators shared by all services
pub struct ServiceContext {
    pub client: Arc<dyn NsxClientTrait>,
    pub store: Arc<ResourceStore>,
    pub allocator: Arc<IpAllocator>,
    pub poller: RealizationPoller,
    pub realize_policy: RetryPolicy,
    pub cluster: String,
    pub project: String,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("cluster", &self.cluster)
            .field("project", &self.project)
            .field("realize_policy", &self.realize_policy)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    /// Policy path of the VPC backing a namespace
    pub fn vpc_path(&self, namespace: &str) -> String {
        format!("/orgs/default/projects/{}/vpcs/{}", self.project, namespace)
    }

    /// Tags written on every backend object owned by a CR
    pub fn build_tags(&self, resource_type: &str, identity: &CrIdentity) -> Vec<Tag> {
        vec![
            Tag::new(TAG_SCOPE_CLUSTER, &self.cluster),
            Tag::new(TAG_SCOPE_NAMESPACE, &identity.key.namespace),
            Tag::new(name_scope(resource_type), &identity.key.name),
            Tag::new(uid_scope(resource_type), &identity.uid),
        ]
    }

    /// Owner of a backend object, if it was created by this cluster
    pub fn identity_from_tags(&self, resource_type: &str, object: &PolicyObject) -> Option<CrIdentity> {
        if object.tag_value(TAG_SCOPE_CLUSTER) != Some(self.cluster.as_str()) {
            return None;
        }
        Some(CrIdentity {
            uid: object.tag_value(&uid_scope(resource_type))?.to_string(),
            key: ObjectKey::new(
                object.tag_value(TAG_SCOPE_NAMESPACE)?,
                object.tag_value(&name_scope(resource_type))?,
            ),
        })
    }

    /// Backend objects of a type created by this cluster
    pub async fn list_owned(&self, nsx_resource_type: &str) -> Result<Vec<PolicyObject>, ControllerError> {
        Ok(self
            .client
            .search_by_tag(nsx_resource_type, TAG_SCOPE_CLUSTER, Some(&self.cluster))
            .await?)
    }

    pub fn track(&self, resource_type: &'static str, identity: &CrIdentity, path: &str, tags: Vec<Tag>) {
        self.store.track(StoreEntry {
            uid: identity.uid.clone(),
            kind: resource_type,
            key: identity.key.clone(),
            backend_path: path.to_string(),
            tags,
        });
    }

    /// Release whatever the owner holds once the backend confirmed the delete
    pub fn release(&self, owner: &str) {
        if let Some(allocation) = self.allocator.allocation_of(owner) {
            self.allocator.release(&allocation.pool, owner);
        }
        self.store.untrack(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_service_context;
    use nsx_client::MockNsxClient;

    fn identity() -> CrIdentity {
        CrIdentity {
            uid: "0123456789abcdef".to_string(),
            key: ObjectKey::new("ns-1", "web"),
        }
    }

    #[test]
    fn test_backend_id_is_deterministic() {
        assert_eq!(backend_id(&identity()), "web_01234567");
        assert_eq!(backend_id(&identity()), backend_id(&identity()));
    }

    #[test]
    fn test_tags_round_trip_to_identity() {
        let ctx = create_service_context(MockNsxClient::new("https://nsx"));
        let mut object = PolicyObject::new("web_01234567", "/p", "VpcSubnet");
        object.tags = ctx.build_tags("subnet", &identity());

        assert_eq!(ctx.identity_from_tags("subnet", &object), Some(identity()));
        assert_eq!(ctx.identity_from_tags("ipaddressallocation", &object), None);
    }

    #[test]
    fn test_foreign_cluster_objects_are_ignored() {
        let ctx = create_service_context(MockNsxClient::new("https://nsx"));
        let mut object = PolicyObject::new("web_01234567", "/p", "VpcSubnet");
        object.tags = ctx.build_tags("subnet", &identity());
        object.tags[0] = Tag::new(TAG_SCOPE_CLUSTER, "other-cluster");
        assert_eq!(ctx.identity_from_tags("subnet", &object), None);
    }

    #[test]
    fn test_vpc_path() {
        let ctx = create_service_context(MockNsxClient::new("https://nsx"));
        assert_eq!(ctx.vpc_path("ns-1"), "/orgs/default/projects/default/vpcs/ns-1");
    }
}
