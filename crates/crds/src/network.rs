//! Network CRD
//!
//! Describes the network stack backing a namespace. The `Network` annotated
//! as default in the default-network namespace decides the network mode of
//! system namespaces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation marking the cluster-wide default `Network`
pub const ANNOTATION_DEFAULT_NETWORK: &str = "netoperator.vmware.com/default-network";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "netoperator.vmware.com",
    version = "v1alpha1",
    kind = "Network",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network stack providing this network
    #[serde(rename = "type", default)]
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum NetworkType {
    /// VPC network stack driven by this operator
    #[serde(rename = "nsx-operator")]
    NsxtVpc,
    /// Legacy NSX-T network stack
    #[default]
    #[serde(rename = "nsx-t")]
    Nsxt,
    #[serde(rename = "vsphere-distributed")]
    Vsphere,
}

impl Network {
    /// True if annotated as the default network
    pub fn is_default(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_DEFAULT_NETWORK))
            .is_some_and(|v| v == "true")
    }
}
