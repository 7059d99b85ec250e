//! IPAddressAllocation service.
//!
//! Allocates a CIDR from the pool matching the requested visibility and
//! publishes it as a `VpcIpAddressAllocation` under the namespace's VPC.

use super::{backend_id, CrIdentity, ResourceService, ServiceContext};
use crate::allocator::{parse_ip_or_cidr, validate_request};
use crate::error::ControllerError;
use crate::resource::ManagedResource;
use async_trait::async_trait;
use crds::{IPAddressAllocation, IPAddressVisibility};
use nsx_client::PolicyObject;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// NSX resource type of the backend object
pub const NSX_RESOURCE_TYPE: &str = "VpcIpAddressAllocation";

fn visibility_to_nsx(visibility: IPAddressVisibility) -> &'static str {
    match visibility {
        IPAddressVisibility::Private => "PRIVATE",
        IPAddressVisibility::External => "EXTERNAL",
        IPAddressVisibility::PrivateTgw => "PRIVATE_TGW",
    }
}

fn visibility_from_nsx(value: &str) -> Option<IPAddressVisibility> {
    match value {
        "PRIVATE" => Some(IPAddressVisibility::Private),
        "EXTERNAL" => Some(IPAddressVisibility::External),
        "PRIVATE_TGW" => Some(IPAddressVisibility::PrivateTgw),
        _ => None,
    }
}

/// Backend service for `IPAddressAllocation`
#[derive(Debug, Clone)]
pub struct IpAddressAllocationService {
    ctx: Arc<ServiceContext>,
}

impl IpAddressAllocationService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Policy path of the allocation owned by a CR
    pub fn path_for(&self, identity: &CrIdentity) -> String {
        format!(
            "{}/ip-address-allocations/{}",
            self.ctx.vpc_path(&identity.key.namespace),
            backend_id(identity)
        )
    }
}

#[async_trait]
impl ResourceService<IPAddressAllocation> for IpAddressAllocationService {
    async fn create_or_update(&self, obj: &mut IPAddressAllocation) -> Result<bool, ControllerError> {
        let identity = CrIdentity::from_resource(obj)?;
        let visibility = obj.spec.ip_address_block_visibility;
        let request = validate_request(obj.spec.allocation_size, obj.spec.allocation_ips.as_deref())?;

        let pool = visibility.pool_name();
        let cidr = self.ctx.allocator.allocate(pool, request, &identity.uid)?;
        if let Some(usage) = self.ctx.allocator.usage(pool) {
            debug!(
                "Pool {} usage after allocating {} for {}: {}/{}",
                pool, cidr, identity.key, usage.allocated, usage.capacity
            );
        }

        let path = self.path_for(&identity);
        let tags = self.ctx.build_tags(IPAddressAllocation::RESOURCE_TYPE, &identity);
        let mut desired = PolicyObject::new(backend_id(&identity), &path, NSX_RESOURCE_TYPE);
        desired.display_name = Some(identity.key.name.clone());
        desired.tags.clone_from(&tags);
        desired.properties.insert("allocation_ips".to_string(), json!(cidr.to_string()));
        desired
            .properties
            .insert("ip_address_block_visibility".to_string(), json!(visibility_to_nsx(visibility)));

        // Tracked before any backend call so a failed create is still found
        // by delete-by-key and GC, which release the allocation
        self.ctx
            .track(IPAddressAllocation::RESOURCE_TYPE, &identity, &path, tags);

        let existing = self.ctx.client.get_object(&path).await?;
        let mut changed = existing.as_ref().is_none_or(|e| !desired.same_intent(e));
        if changed {
            info!("Creating or updating NSX IP address allocation {} for {}", path, identity.key);
            self.ctx.client.patch_object(&path, &desired).await?;
            self.ctx
                .poller
                .check_realize_state(&self.ctx.realize_policy, &path, &[])
                .await?;
        } else {
            debug!("NSX IP address allocation {} already up to date", path);
        }

        let allocated = Some(cidr.to_string());
        let status = obj.status.get_or_insert_with(Default::default);
        if status.allocation_ips != allocated {
            status.allocation_ips = allocated;
            changed = true;
        }
        Ok(changed)
    }

    async fn delete(&self, identity: &CrIdentity) -> Result<(), ControllerError> {
        let path = self
            .ctx
            .store
            .lookup(&identity.uid)
            .map(|e| e.backend_path)
            .unwrap_or_else(|| self.path_for(identity));
        info!("Deleting NSX IP address allocation {} for {}", path, identity.key);
        self.ctx.client.delete_object(&path).await?;
        self.ctx.release(&identity.uid);
        Ok(())
    }

    fn list_tracked_ids(&self) -> BTreeSet<String> {
        self.ctx.store.list_tracked_ids(IPAddressAllocation::RESOURCE_TYPE)
    }

    async fn rehydrate(&self) -> Result<usize, ControllerError> {
        let mut restored = 0;
        for object in self.ctx.list_owned(NSX_RESOURCE_TYPE).await? {
            let Some(identity) = self.ctx.identity_from_tags(IPAddressAllocation::RESOURCE_TYPE, &object) else {
                warn!("Skipping NSX IP address allocation {} without owner tags", object.path);
                continue;
            };

            let pool = object
                .property_str("ip_address_block_visibility")
                .and_then(visibility_from_nsx)
                .map(|v| v.pool_name());
            match (pool, object.property_str("allocation_ips").map(parse_ip_or_cidr)) {
                (Some(pool), Some(Ok(cidr))) => {
                    if let Err(e) = self.ctx.allocator.mark_allocated(pool, cidr, &identity.uid) {
                        warn!("Cannot restore allocation {} of {}: {}", cidr, identity.key, e);
                    }
                }
                _ => warn!("NSX IP address allocation {} has no usable allocation_ips", object.path),
            }

            self.ctx.track(
                IPAddressAllocation::RESOURCE_TYPE,
                &identity,
                &object.path,
                object.tags.clone(),
            );
            restored += 1;
        }
        Ok(restored)
    }
}
