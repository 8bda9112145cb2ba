//! libp2p identity for circuit relays
//!
//! Relays get an ed25519 keypair generated by the operator and stored in a
//! Secret, so the peer ID is known before the relay pod ever starts and stays
//! stable across restarts.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use libp2p_identity::{KeyType, Keypair};
use serde_json::json;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct RelayIdentity {
    keypair: Keypair,
}

impl std::fmt::Debug for RelayIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayIdentity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn key_error(err: impl std::fmt::Display) -> Error {
    Error::ConfigError(format!("invalid relay key: {err}"))
}

impl RelayIdentity {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate_ed25519(),
        }
    }

    pub fn from_seed(mut seed: [u8; 32]) -> Result<Self> {
        let keypair = Keypair::ed25519_from_bytes(&mut seed).map_err(key_error)?;
        Ok(Self { keypair })
    }

    /// Restore an identity from its protobuf-encoded private key
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self> {
        let keypair = Keypair::from_protobuf_encoding(bytes).map_err(key_error)?;
        if keypair.key_type() != KeyType::Ed25519 {
            return Err(Error::ConfigError(format!(
                "relay key must be ed25519, got {:?}",
                keypair.key_type()
            )));
        }
        Ok(Self { keypair })
    }

    pub fn public_key_protobuf(&self) -> Vec<u8> {
        self.keypair.public().encode_protobuf()
    }

    pub fn private_key_protobuf(&self) -> Result<Vec<u8>> {
        self.keypair.to_protobuf_encoding().map_err(key_error)
    }

    /// Base58btc peer ID (`12D3KooW...`)
    pub fn peer_id(&self) -> String {
        self.keypair.public().to_peer_id().to_base58()
    }

    /// Identity section in the format the relay daemon reads
    pub fn config_json(&self) -> Result<String> {
        Ok(json!({
            "PeerID": self.peer_id(),
            "PrivKey": STANDARD.encode(self.private_key_protobuf()?),
        })
        .to_string())
    }
}
