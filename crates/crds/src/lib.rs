//! NSX Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions reconciled or validated by the
//! NSX operator, plus the status condition types they share.

pub mod condition;
pub mod ip_address_allocation;
pub mod subnet;
pub mod address_binding;
pub mod network;

pub use condition::*;
pub use ip_address_allocation::*;
pub use subnet::*;
pub use address_binding::*;
pub use network::*;
