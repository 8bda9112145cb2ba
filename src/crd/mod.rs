//! Custom Resource Definitions for the IPFS operator
//!
//! This module defines the `Ipfs` node and `CircuitRelay` CRDs.

mod circuit_relay;
mod ipfs;
pub mod types;


pub use circuit_relay::{CircuitRelay, CircuitRelaySpec, CircuitRelayStatus};
pub use ipfs::{Ipfs, IpfsSpec, IpfsStatus, SpecValidationError, MAX_RELAYS};
pub use types::*;
