//! Subnet validation: size and CIDR syntax on create, immutable spec on update.

use super::{immutable, Validator, Verdict};
use crate::allocator::parse_ip_or_cidr;
use crate::resource::ManagedResource;
use async_trait::async_trait;
use crds::Subnet;
use kube::core::admission::Operation;

pub struct SubnetValidator;

fn validate_create(new: &Subnet) -> Verdict {
    if let Some(size) = new.spec.ipv4_subnet_size {
        if !size.is_power_of_two() {
            return Verdict::Deny(format!("ipv4SubnetSize {} must be a power of two", size));
        }
    }
    for cidr in &new.spec.ip_addresses {
        if let Err(e) = parse_ip_or_cidr(cidr) {
            return Verdict::Deny(e.to_string());
        }
    }
    if new.spec.ip_addresses.len() > 1 {
        return Verdict::Deny("only one entry in ipAddresses is supported".to_string());
    }
    Verdict::Allow
}

fn validate_update(old: &Subnet, new: &Subnet) -> Verdict {
    if old.spec.ipv4_subnet_size.is_some() && old.spec.ipv4_subnet_size != new.spec.ipv4_subnet_size {
        return immutable("ipv4SubnetSize");
    }
    if old.spec.access_mode != new.spec.access_mode {
        return immutable("accessMode");
    }
    if !old.spec.ip_addresses.is_empty() && old.spec.ip_addresses != new.spec.ip_addresses {
        return immutable("ipAddresses");
    }
    Verdict::Allow
}

#[async_trait]
impl Validator for SubnetValidator {
    type Object = Subnet;

    fn resource_type(&self) -> &'static str {
        Subnet::RESOURCE_TYPE
    }

    async fn validate(&self, operation: Operation, old: Option<Subnet>, new: Option<Subnet>) -> Verdict {
        match (operation, old, new) {
            (Operation::Create, _, Some(new)) => validate_create(&new),
            (Operation::Update, Some(old), Some(new)) => validate_update(&old, &new),
            (Operation::Delete | Operation::Connect, ..) => Verdict::Allow,
            (operation, ..) => Verdict::Errored(400, format!("{:?} request without the expected object", operation)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_subnet;
    use crds::SubnetAccessMode;

    #[tokio::test]
    async fn test_create_checks_size_and_cidrs() {
        let mut subnet = create_test_subnet("ns-1", "web", "uid-1");
        assert_eq!(SubnetValidator.validate(Operation::Create, None, Some(subnet.clone())).await, Verdict::Allow);

        subnet.spec.ipv4_subnet_size = Some(48);
        assert!(matches!(
            SubnetValidator.validate(Operation::Create, None, Some(subnet.clone())).await,
            Verdict::Deny(m) if m.contains("power of two")
        ));

        subnet.spec.ipv4_subnet_size = None;
        subnet.spec.ip_addresses = vec!["10.0.0.0/33".to_string()];
        assert!(matches!(
            SubnetValidator.validate(Operation::Create, None, Some(subnet)).await,
            Verdict::Deny(_)
        ));
    }

    #[tokio::test]
    async fn test_update_immutable_fields() {
        let mut old = create_test_subnet("ns-1", "web", "uid-1");
        old.spec.ipv4_subnet_size = Some(32);

        let mut new = old.clone();
        new.spec.access_mode = SubnetAccessMode::Public;
        assert_eq!(
            SubnetValidator.validate(Operation::Update, Some(old.clone()), Some(new)).await,
            Verdict::Deny("accessMode is immutable".to_string())
        );

        let mut new = old.clone();
        new.spec.ipv4_subnet_size = Some(64);
        assert_eq!(
            SubnetValidator.validate(Operation::Update, Some(old.clone()), Some(new)).await,
            Verdict::Deny("ipv4SubnetSize is immutable".to_string())
        );

        assert_eq!(
            SubnetValidator.validate(Operation::Update, Some(old.clone()), Some(old)).await,
            Verdict::Allow
        );
    }
}
