//! Subnet service.
//!
//! Carves the subnet CIDR from the pool matching the access mode (or takes
//! the explicit one) and publishes a `VpcSubnet` under the namespace's VPC.

use super::{backend_id, CrIdentity, ResourceService, ServiceContext};
use crate::allocator::{parse_ip_or_cidr, validate_request, AllocationRequest};
use crate::error::ControllerError;
use crate::resource::ManagedResource;
use async_trait::async_trait;
use crds::{Subnet, SubnetAccessMode};
use ipnetwork::IpNetwork;
use nsx_client::PolicyObject;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// NSX resource type of the backend object
pub const NSX_RESOURCE_TYPE: &str = "VpcSubnet";

/// Realized entity that proves the segment exists on the data path
const REALIZED_MARKERS: &[&str] = &["RealizedLogicalSwitch"];

fn access_mode_to_nsx(mode: SubnetAccessMode) -> &'static str {
    match mode {
        SubnetAccessMode::Private => "Private",
        SubnetAccessMode::Public => "Public",
        SubnetAccessMode::PrivateTgw => "PrivateTGW",
    }
}

fn access_mode_from_nsx(value: &str) -> Option<SubnetAccessMode> {
    match value {
        "Private" => Some(SubnetAccessMode::Private),
        "Public" => Some(SubnetAccessMode::Public),
        "PrivateTGW" => Some(SubnetAccessMode::PrivateTgw),
        _ => None,
    }
}

/// First usable address as gateway, for IPv4 subnets of at least four addresses
fn gateway_address(cidr: &IpNetwork) -> Option<String> {
    match cidr {
        IpNetwork::V4(net) if net.prefix() <= 30 => {
            let gateway = Ipv4Addr::from(u32::from(net.network()).checked_add(1)?);
            Some(format!("{}/{}", gateway, net.prefix()))
        }
        _ => None,
    }
}

fn allocation_request(subnet: &Subnet) -> Result<AllocationRequest, ControllerError> {
    match subnet.spec.ip_addresses.as_slice() {
        [] => Ok(validate_request(Some(subnet.spec.size()), None)?),
        [cidr] => Ok(AllocationRequest::Explicit(parse_ip_or_cidr(cidr)?)),
        more => Err(ControllerError::InvalidResource(format!(
            "only one entry in ipAddresses is supported, got {}",
            more.len()
        ))),
    }
}

/// Backend service for `Subnet`
#[derive(Debug, Clone)]
pub struct SubnetService {
    ctx: Arc<ServiceContext>,
}

impl SubnetService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn path_for(&self, identity: &CrIdentity) -> String {
        format!(
            "{}/subnets/{}",
            self.ctx.vpc_path(&identity.key.namespace),
            backend_id(identity)
        )
    }
}

#[async_trait]
impl ResourceService<Subnet> for SubnetService {
    async fn create_or_update(&self, obj: &mut Subnet) -> Result<bool, ControllerError> {
        let identity = CrIdentity::from_resource(obj)?;
        let mode = obj.spec.access_mode;
        let request = allocation_request(obj)?;
        let pool = mode.pool_name();
        let cidr = self.ctx.allocator.allocate(pool, request, &identity.uid)?;
        if let Some(usage) = self.ctx.allocator.usage(pool) {
            debug!("Pool {} usage: {}/{} addresses", pool, usage.allocated, usage.capacity);
        }

        let path = self.path_for(&identity);
        let tags = self.ctx.build_tags(Subnet::RESOURCE_TYPE, &identity);
        let mut desired = PolicyObject::new(backend_id(&identity), &path, NSX_RESOURCE_TYPE);
        desired.display_name = Some(identity.key.name.clone());
        desired.tags.clone_from(&tags);
        desired.properties.insert("ip_addresses".to_string(), json!([cidr.to_string()]));
        desired
            .properties
            .insert("access_mode".to_string(), json!(access_mode_to_nsx(mode)));
        desired.properties.insert(
            "ipv4_subnet_size".to_string(),
            json!(crate::allocator::cidr_len(&cidr)),
        );

        // Tracked before any backend call so a failed create is still found
        // by delete-by-key and GC, which release the CIDR
        self.ctx.track(Subnet::RESOURCE_TYPE, &identity, &path, tags);

        let existing = self.ctx.client.get_object(&path).await?;
        let mut changed = existing.as_ref().is_none_or(|e| !desired.same_intent(e));
        if changed {
            info!("Creating or updating NSX subnet {} ({}) for {}", path, cidr, identity.key);
            self.ctx.client.patch_object(&path, &desired).await?;
            self.ctx
                .poller
                .check_realize_state(&self.ctx.realize_policy, &path, REALIZED_MARKERS)
                .await?;
        }

        let network_addresses = vec![cidr.to_string()];
        let gateway_addresses: Vec<String> = gateway_address(&cidr).into_iter().collect();
        let status = obj.status.get_or_insert_with(Default::default);
        if status.network_addresses != network_addresses || status.gateway_addresses != gateway_addresses {
            status.network_addresses = network_addresses;
            status.gateway_addresses = gateway_addresses;
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
        info!("Deleting NSX subnet {} for {}", path, identity.key);
        self.ctx.client.delete_object(&path).await?;
        self.ctx.release(&identity.uid);
        Ok(())
    }

    fn list_tracked_ids(&self) -> BTreeSet<String> {
        self.ctx.store.list_tracked_ids(Subnet::RESOURCE_TYPE)
    }

    async fn rehydrate(&self) -> Result<usize, ControllerError> {
        let mut restored = 0;
        for object in self.ctx.list_owned(NSX_RESOURCE_TYPE).await? {
            let Some(identity) = self.ctx.identity_from_tags(Subnet::RESOURCE_TYPE, &object) else {
                warn!("Skipping NSX subnet {} without owner tags", object.path);
                continue;
            };
            let pool = object
                .property_str("access_mode")
                .and_then(access_mode_from_nsx)
                .map(|m| m.pool_name());
            let cidr = object
                .properties
                .get("ip_addresses")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .map(parse_ip_or_cidr);

            match (pool, cidr) {
                (Some(pool), Some(Ok(cidr))) => {
                    if let Err(e) = self.ctx.allocator.mark_allocated(pool, cidr, &identity.uid) {
                        warn!("Cannot restore subnet {} of {}: {}", cidr, identity.key, e);
                    }
                }
                _ => debug!("NSX subnet {} carries no restorable CIDR", object.path),
            }
            self.ctx
                .track(Subnet::RESOURCE_TYPE, &identity, &object.path, object.tags.clone());
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ObjectKey;
    use crate::test_utils::{create_service_context, create_test_subnet};
    use nsx_client::{MockNsxClient, RealizationState, RealizedEntity};

    const PATH: &str = "/orgs/default/projects/default/vpcs/ns-1/subnets/web_uid-0001";

    fn realized(mock: &MockNsxClient) {
        mock.script_realization(
            PATH,
            vec![
                vec![RealizedEntity::new("RealizedLogicalPort", RealizationState::Realized)],
                vec![RealizedEntity::new("RealizedLogicalSwitch", RealizationState::Realized)],
            ],
        );
    }

    fn service(mock: &MockNsxClient) -> SubnetService {
        SubnetService::new(Arc::new(create_service_context(mock.clone())))
    }

    #[test]
    fn test_gateway_address() {
        let net: IpNetwork = "10.0.0.0/26".parse().unwrap();
        assert_eq!(gateway_address(&net).as_deref(), Some("10.0.0.1/26"));
        let tiny: IpNetwork = "10.0.0.4/31".parse().unwrap();
        assert_eq!(gateway_address(&tiny), None);
    }

    #[tokio::test]
    async fn test_create_waits_for_marker_and_fills_status() {
        let mock = MockNsxClient::new("https://nsx");
        realized(&mock);
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        subnet.spec.ipv4_subnet_size = Some(16);

        assert!(svc.create_or_update(&mut subnet).await.unwrap());
        assert_eq!(mock.realization_polls(), 2);

        let stored = mock.object(PATH).unwrap();
        assert_eq!(stored.property_str("access_mode"), Some("Private"));
        let status = subnet.status.unwrap();
        assert_eq!(status.network_addresses, vec!["10.0.0.0/28".to_string()]);
        assert_eq!(status.gateway_addresses, vec!["10.0.0.1/28".to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_cidr_must_fit_pool() {
        let mock = MockNsxClient::new("https://nsx");
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        subnet.spec.ip_addresses = vec!["192.168.50.0/28".to_string()];

        let err = svc.create_or_update(&mut subnet).await.unwrap_err();
        assert_eq!(err.reason(), "AllocationFailed");
        assert_eq!(mock.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_multiple_explicit_cidrs_are_rejected() {
        let mock = MockNsxClient::new("https://nsx");
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        subnet.spec.ip_addresses = vec!["10.0.0.0/28".to_string(), "10.0.0.16/28".to_string()];

        let err = svc.create_or_update(&mut subnet).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidResource(_)));
    }

    #[tokio::test]
    async fn test_public_subnet_uses_external_pool() {
        let mock = MockNsxClient::new("https://nsx");
        realized(&mock);
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        subnet.spec.access_mode = SubnetAccessMode::Public;
        subnet.spec.ipv4_subnet_size = Some(8);

        svc.create_or_update(&mut subnet).await.unwrap();
        assert_eq!(subnet.status.unwrap().network_addresses, vec!["192.168.0.0/29".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_create_is_released_by_delete_by_key() {
        let mock = MockNsxClient::new("https://nsx");
        mock.fail_path(PATH);
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        subnet.spec.ipv4_subnet_size = Some(16);

        assert!(svc.create_or_update(&mut subnet).await.is_err());
        assert_eq!(svc.ctx.allocator.usage("vpc-private").unwrap().allocated, 16);

        mock.heal_path(PATH);
        let key = ObjectKey::new("ns-1", "web");
        let entry = svc.ctx.store.lookup_by_key(Subnet::RESOURCE_TYPE, &key).unwrap();
        assert_eq!(entry.backend_path, PATH);
        svc.delete(&CrIdentity::from_entry(&entry)).await.unwrap();

        assert_eq!(svc.ctx.allocator.usage("vpc-private").unwrap().allocated, 0);
        assert!(svc.list_tracked_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_rehydrate() {
        let mock = MockNsxClient::new("https://nsx");
        realized(&mock);
        let svc = service(&mock);
        let mut subnet = create_test_subnet("ns-1", "web", "uid-0001-abcd");
        svc.create_or_update(&mut subnet).await.unwrap();

        let restarted = service(&mock);
        assert_eq!(restarted.rehydrate().await.unwrap(), 1);
        assert!(restarted.list_tracked_ids().contains("uid-0001-abcd"));

        let identity = CrIdentity::from_resource(&subnet).unwrap();
        restarted.delete(&identity).await.unwrap();
        assert_eq!(mock.effective_deletes(), vec![PATH.to_string()]);
        assert!(restarted.list_tracked_ids().is_empty());
    }
}
