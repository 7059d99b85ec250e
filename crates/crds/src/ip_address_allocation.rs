//! IPAddressAllocation CRD
//!
//! Requests a block of addresses from one of the IP pools, either by size
//! (`allocationSize`) or explicitly (`allocationIPs`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::condition::{Condition, ConditionedResource};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "crd.nsx.vmware.com",
    version = "v1alpha1",
    kind = "IPAddressAllocation",
    namespaced,
    status = "IPAddressAllocationStatus",
    shortname = "ipaddressalloc"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressAllocationSpec {
    /// Which IP block the addresses come from (immutable)
    #[serde(default)]
    pub ip_address_block_visibility: IPAddressVisibility,

    /// Number of addresses to allocate, must be a power of two (immutable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_size: Option<u32>,

    /// Explicit IP or CIDR to allocate (immutable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_ips: Option<String>,
}

/// Visibility of the IP block an allocation is carved from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum IPAddressVisibility {
    #[default]
    Private,
    External,
    #[serde(rename = "PrivateTGW")]
    PrivateTgw,
}

impl IPAddressVisibility {
    /// Name of the allocator pool serving this visibility
    pub fn pool_name(&self) -> &'static str {
        match self {
            IPAddressVisibility::Private => "vpc-private",
            IPAddressVisibility::External => "external",
            IPAddressVisibility::PrivateTgw => "private-tgw",
        }
    }
}

impl std::fmt::Display for IPAddressVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IPAddressVisibility::Private => "Private",
            IPAddressVisibility::External => "External",
            IPAddressVisibility::PrivateTgw => "PrivateTGW",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressAllocationStatus {
    /// Allocated CIDR (observed state)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_ips: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionedResource for IPAddressAllocation {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
