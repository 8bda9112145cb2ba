//! Print the Ipfs and CircuitRelay CRDs as a multi-document YAML stream

use ipfs_operator::crd::{CircuitRelay, Ipfs};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let documents = [
        serde_yaml::to_string(&Ipfs::crd())?,
        serde_yaml::to_string(&CircuitRelay::crd())?,
    ];
    print!("{}", documents.join("---\n"));
    Ok(())
}
