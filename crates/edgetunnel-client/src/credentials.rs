//! Tunnel token decoding
//!
//! A token is `base64(JSON{"a": account tag, "s": base64 secret, "t": tunnel id})`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use edgetunnel_proto::TunnelAuth;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Token is not a valid tunnel token: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Token has an empty {0}")]
    Missing(&'static str),
}

/// Credentials for one named tunnel
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelToken {
    #[serde(rename = "a")]
    pub account_tag: String,
    #[serde(rename = "s", with = "secret_base64")]
    pub tunnel_secret: Vec<u8>,
    #[serde(rename = "t")]
    pub tunnel_id: Uuid,
}

impl std::fmt::Debug for TunnelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelToken")
            .field("account_tag", &self.account_tag)
            .field("tunnel_id", &self.tunnel_id)
            .finish_non_exhaustive()
    }
}

impl TunnelToken {
    pub fn decode(token: &str) -> Result<Self, CredentialsError> {
        let json = STANDARD.decode(token.trim())?;
        let token: TunnelToken = serde_json::from_slice(&json)?;

        if token.account_tag.is_empty() {
            return Err(CredentialsError::Missing("account tag"));
        }
        if token.tunnel_secret.is_empty() {
            return Err(CredentialsError::Missing("tunnel secret"));
        }
        Ok(token)
    }

    pub fn encode(&self) -> Result<String, CredentialsError> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn auth(&self) -> TunnelAuth {
        TunnelAuth {
            account_tag: self.account_tag.clone(),
            tunnel_secret: self.tunnel_secret.clone(),
        }
    }
}

mod secret_base64 {
    use super::*;

    pub fn serialize<S>(secret: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(secret))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
