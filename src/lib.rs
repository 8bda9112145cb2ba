//! ipfs-operator: Kubernetes control plane for IPFS cluster nodes
//!
//! Reconciles `Ipfs` nodes and the `CircuitRelay` resources that give
//! private nodes a reachable address.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
