use crate::config::RepoConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Metadata recorded next to an uploaded bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMetadata {
    /// Base64 PKCS#1 v1.5 signature over the SHA-256 of the archive.
    #[serde(default)]
    pub signature: Option<String>,

    /// Hex SHA-256 of the archive.
    #[serde(default)]
    pub hash: Option<String>,

    /// Archive type hint ("tar.gz", "tar.bz2", "zip").
    #[serde(default)]
    pub extension: Option<String>,
}

/// Bundle repository collaborator. Cloud providers live outside the core;
/// the built-in backend reads a local directory.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Open a bundle by name, returning its byte stream and metadata.
    async fn get(&self, name: &str) -> Result<(Box<dyn AsyncRead + Send + Unpin>, ObjectMetadata)>;
}

/// Directory-backed repository. Metadata comes from an optional
/// `<name>.meta` JSON sidecar.
pub struct LocalStorage {
    path: PathBuf,
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn get(&self, name: &str) -> Result<(Box<dyn AsyncRead + Send + Unpin>, ObjectMetadata)> {
        // Bundle names come from state documents, but stay defensive about
        // path traversal anyway.
        anyhow::ensure!(
            !name.contains('/') && !name.contains(".."),
            "invalid bundle name: {}",
            name
        );

        let file = tokio::fs::File::open(self.path.join(name))
            .await
            .with_context(|| format!("opening bundle {}", name))?;

        let metadata = match tokio::fs::read(self.path.join(format!("{}.meta", name))).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing metadata sidecar for {}", name))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectMetadata::default(),
            Err(e) => return Err(e).context("reading metadata sidecar"),
        };

        Ok((Box::new(file), metadata))
    }
}

/// Build the storage backend described by cluster options. Only "local" is
/// built in; anything else must be provided by the embedding binary.
pub fn from_repo_config(repo: &RepoConfig) -> Result<Arc<dyn ObjectStorage>> {
    match repo.kind.as_str() {
        "local" => Ok(Arc::new(LocalStorage::new(&repo.path))),
        other => anyhow::bail!("unsupported repo kind {}, wire a provider for it", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_local_get_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app1.tar.gz"), b"bytes").unwrap();
        std::fs::write(
            dir.path().join("app1.tar.gz.meta"),
            r#"{"hash": "aa", "extension": "tar.gz"}"#,
        )
        .unwrap();

        let storage = LocalStorage::new(dir.path());
        let (mut stream, meta) = storage.get("app1.tar.gz").await.unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"bytes");
        assert_eq!(meta.hash.as_deref(), Some("aa"));
        assert_eq!(meta.extension.as_deref(), Some("tar.gz"));
        assert!(meta.signature.is_none());
    }

    #[tokio::test]
    async fn test_local_get_missing_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        assert!(storage.get("absent").await.is_err());
        assert!(storage.get("../etc/passwd").await.is_err());
    }

    #[test]
    fn test_repo_factory() {
        let repo = RepoConfig::default();
        assert!(from_repo_config(&repo).is_ok());
        let bad = RepoConfig {
            kind: "s3".to_string(),
            ..RepoConfig::default()
        };
        assert!(from_repo_config(&bad).is_err());
    }
}
