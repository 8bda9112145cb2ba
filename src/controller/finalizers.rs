//! Finalizer names
//!
//! Finalizers keep an `Ipfs` or `CircuitRelay` around until its workload and
//! follow sessions have been released. The kube-rs `finalizer` helper adds and
//! removes them around the Apply and Cleanup events.

/// Finalizer protecting `Ipfs` resources
pub const IPFS_FINALIZER: &str = "ipfs.cluster.ipfs.io/finalizer";

/// Finalizer protecting `CircuitRelay` resources
pub const CIRCUIT_RELAY_FINALIZER: &str = "circuitrelay.cluster.ipfs.io/finalizer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizers_are_domain_qualified() {
        for name in [IPFS_FINALIZER, CIRCUIT_RELAY_FINALIZER] {
            let (domain, path) = name.split_once('/').unwrap();
            assert!(domain.ends_with("cluster.ipfs.io"));
            assert_eq!(path, "finalizer");
        }
        assert_ne!(IPFS_FINALIZER, CIRCUIT_RELAY_FINALIZER);
    }
}
