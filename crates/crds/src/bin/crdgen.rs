//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{AddressBinding, IPAddressAllocation, Network, Subnet};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        IPAddressAllocation::crd(),
        Subnet::crd(),
        AddressBinding::crd(),
        Network::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
