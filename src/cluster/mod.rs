pub mod client;
pub mod registry;
pub mod server;

pub use client::{ChannelClient, ChannelHandle, ControllerClient};
pub use registry::{HealthRequestSender, NodeRegistry};
pub use server::ChannelServer;

use serde::{Deserialize, Serialize};

/// Body of the `certificate` RPC. Either a certificate id from the state
/// document, or a vault reference for vault-typed site TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateRequest {
    #[serde(default)]
    pub certificate_id: Option<String>,

    #[serde(default)]
    pub vault_name: Option<String>,

    #[serde(default)]
    pub vault_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateResponse {
    pub key_pem: String,
    pub cert_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub token: String,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub response: String,
}
