//! Subnet CRD
//!
//! A VPC subnet whose CIDR is carved from the pool matching its access mode.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::condition::{Condition, ConditionedResource};

/// Default number of addresses in a subnet when `ipv4SubnetSize` is unset
pub const DEFAULT_SUBNET_SIZE: u32 = 64;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "crd.nsx.vmware.com",
    version = "v1alpha1",
    kind = "Subnet",
    namespaced,
    status = "SubnetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Number of IPv4 addresses, power of two (immutable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_subnet_size: Option<u32>,

    /// Access mode (immutable)
    #[serde(default)]
    pub access_mode: SubnetAccessMode,

    /// Explicit CIDRs; when set no size-based allocation happens
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

impl SubnetSpec {
    /// Requested size, falling back to the default
    pub fn size(&self) -> u32 {
        self.ipv4_subnet_size.unwrap_or(DEFAULT_SUBNET_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum SubnetAccessMode {
    #[default]
    Private,
    Public,
    #[serde(rename = "PrivateTGW")]
    PrivateTgw,
}

impl SubnetAccessMode {
    /// Name of the allocator pool serving this access mode
    pub fn pool_name(&self) -> &'static str {
        match self {
            SubnetAccessMode::Private => "vpc-private",
            SubnetAccessMode::Public => "external",
            SubnetAccessMode::PrivateTgw => "private-tgw",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateway_addresses: Vec<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionedResource for Subnet {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
