//! IPAddressAllocation validation.
//!
//! Create: the size/explicit-address combination must be a valid request.
//! Update: visibility, size and addresses are immutable once set.
//! Delete: denied while an AddressBinding references the allocation or a
//! Service uses one of its addresses.

use super::{immutable, AdmissionLookup, Validator, Verdict};
use crate::allocator::{cidr_contains, validate_request};
use crate::resource::ManagedResource;
use async_trait::async_trait;
use crds::IPAddressAllocation;
use kube::core::admission::Operation;
use kube::ResourceExt;
use std::sync::Arc;

pub struct IpAddressAllocationValidator {
    lookup: Arc<dyn AdmissionLookup>,
}

impl IpAddressAllocationValidator {
    pub fn new(lookup: Arc<dyn AdmissionLookup>) -> Self {
        Self { lookup }
    }

    async fn validate_delete(&self, old: &IPAddressAllocation) -> Verdict {
        let name = old.name_any();
        let namespace = old.namespace().unwrap_or_default();

        let bindings = match self.lookup.list_address_bindings(&namespace).await {
            Ok(bindings) => bindings,
            Err(e) => return e.into(),
        };
        if let Some(binding) = bindings
            .iter()
            .find(|b| b.spec.ip_address_allocation_name.as_deref() == Some(name.as_str()))
        {
            return Verdict::Deny(format!(
                "IPAddressAllocation {} is still referenced by AddressBinding {}",
                name,
                binding.name_any()
            ));
        }

        let allocated = old
            .status
            .as_ref()
            .and_then(|s| s.allocation_ips.clone())
            .or_else(|| old.spec.allocation_ips.clone());
        let Some(allocated) = allocated else {
            return Verdict::Allow;
        };

        let services = match self.lookup.list_services(&namespace).await {
            Ok(services) => services,
            Err(e) => return e.into(),
        };
        for service in services {
            let in_use = service
                .ips
                .iter()
                .any(|ip| cidr_contains(&allocated, ip).unwrap_or(false));
            if in_use {
                return Verdict::Deny(format!(
                    "IPAddressAllocation {} is still in use by Service {}",
                    name, service.name
                ));
            }
        }
        Verdict::Allow
    }
}

fn validate_update(old: &IPAddressAllocation, new: &IPAddressAllocation) -> Verdict {
    if old.spec.ip_address_block_visibility != new.spec.ip_address_block_visibility {
        return immutable("ipAddressBlockVisibility");
    }
    if old.spec.allocation_size.is_some() && old.spec.allocation_size != new.spec.allocation_size {
        return immutable("allocationSize");
    }
    if old.spec.allocation_ips.is_some() && old.spec.allocation_ips != new.spec.allocation_ips {
        return immutable("allocationIPs");
    }
    Verdict::Allow
}

#[async_trait]
impl Validator for IpAddressAllocationValidator {
    type Object = IPAddressAllocation;

    fn resource_type(&self) -> &'static str {
        IPAddressAllocation::RESOURCE_TYPE
    }

    async fn validate(
        &self,
        operation: Operation,
        old: Option<IPAddressAllocation>,
        new: Option<IPAddressAllocation>,
    ) -> Verdict {
        match (operation, old, new) {
            (Operation::Create, _, Some(new)) => {
                match validate_request(new.spec.allocation_size, new.spec.allocation_ips.as_deref()) {
                    Ok(_) => Verdict::Allow,
                    Err(e) => Verdict::Deny(e.to_string()),
                }
            }
            (Operation::Update, Some(old), Some(new)) => validate_update(&old, &new),
            (Operation::Delete, Some(old), _) => self.validate_delete(&old).await,
            (Operation::Connect, ..) => Verdict::Allow,
            (operation, ..) => Verdict::Errored(400, format!("{:?} request without the expected object", operation)),
        }
    }
}
