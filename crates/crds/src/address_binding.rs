//! AddressBinding CRD
//!
//! Binds an external IP (optionally taken from an IPAddressAllocation) to a
//! VM interface. Only validated at admission time by this operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "crd.nsx.vmware.com",
    version = "v1alpha1",
    kind = "AddressBinding",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AddressBindingSpec {
    /// Name of the VM (immutable)
    pub vm_name: String,

    /// Interface of the VM, empty for the default interface (immutable)
    #[serde(default)]
    pub interface_name: String,

    /// IPAddressAllocation in the same namespace providing the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address_allocation_name: Option<String>,
}
