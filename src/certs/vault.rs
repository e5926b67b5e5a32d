use anyhow::Result;
use async_trait::async_trait;

/// External key-vault collaborator. The core only needs "name + optional
/// version → PEM pair"; concrete providers are wired by the embedding
/// binary.
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn get_certificate(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<(String, String)>;
}
