//! AddressBinding validation.
//!
//! Create: one binding per VM interface, and a referenced
//! IPAddressAllocation must exist, be External and hold a single IP.
//! Update: `vmName` and `interfaceName` are immutable.

use super::{immutable, AdmissionLookup, Validator, Verdict};
use crate::allocator::{is_single_host, validate_request, AllocationRequest};
use async_trait::async_trait;
use crds::{AddressBinding, IPAddressVisibility};
use kube::core::admission::Operation;
use kube::ResourceExt;
use std::sync::Arc;

pub struct AddressBindingValidator {
    lookup: Arc<dyn AdmissionLookup>,
}

impl AddressBindingValidator {
    pub fn new(lookup: Arc<dyn AdmissionLookup>) -> Self {
        Self { lookup }
    }

    async fn validate_create(&self, new: &AddressBinding) -> Verdict {
        let namespace = new.namespace().unwrap_or_default();
        let bindings = match self.lookup.list_address_bindings(&namespace).await {
            Ok(bindings) => bindings,
            Err(e) => return e.into(),
        };
        let taken = bindings.iter().any(|b| {
            b.name_any() != new.name_any()
                && b.spec.vm_name == new.spec.vm_name
                && b.spec.interface_name == new.spec.interface_name
        });
        if taken {
            return Verdict::Deny("interface already has AddressBinding".to_string());
        }

        let Some(alloc_name) = new.spec.ip_address_allocation_name.as_deref() else {
            return Verdict::Allow;
        };
        let alloc = match self.lookup.get_ip_allocation(&namespace, alloc_name).await {
            Ok(Some(alloc)) => alloc,
            Ok(None) => {
                return Verdict::Deny(format!("IPAddressAllocation {} does not exist", alloc_name));
            }
            Err(e) => return e.into(),
        };
        if alloc.spec.ip_address_block_visibility != IPAddressVisibility::External {
            return Verdict::Deny(format!(
                "IPAddressAllocation {} must have External visibility, got {}",
                alloc_name, alloc.spec.ip_address_block_visibility
            ));
        }
        let single = match validate_request(alloc.spec.allocation_size, alloc.spec.allocation_ips.as_deref()) {
            Ok(AllocationRequest::Size(size)) => size == 1,
            Ok(AllocationRequest::Explicit(net)) => is_single_host(&net),
            Err(e) => return Verdict::Deny(e.to_string()),
        };
        if !single {
            return Verdict::Deny(format!("IPAddressAllocation {} must be a single IP", alloc_name));
        }
        Verdict::Allow
    }
}

#[async_trait]
impl Validator for AddressBindingValidator {
    type Object = AddressBinding;

    fn resource_type(&self) -> &'static str {
        "addressbinding"
    }

    async fn validate(
        &self,
        operation: Operation,
        old: Option<AddressBinding>,
        new: Option<AddressBinding>,
    ) -> Verdict {
        match (operation, old, new) {
            (Operation::Create, _, Some(new)) => self.validate_create(&new).await,
            (Operation::Update, Some(old), Some(new)) => {
                if old.spec.vm_name != new.spec.vm_name {
                    immutable("vmName")
                } else if old.spec.interface_name != new.spec.interface_name {
                    immutable("interfaceName")
                } else {
                    Verdict::Allow
                }
            }
            (Operation::Delete | Operation::Connect, ..) => Verdict::Allow,
            (operation, ..) => Verdict::Errored(400, format!("{:?} request without the expected object", operation)),
        }
    }
}
