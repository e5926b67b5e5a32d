use crate::state::store::{LockLease, StateStore};
use crate::state::StateDoc;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Single-file JSON backend. Writes go through a sibling temp file plus
/// rename so readers never observe a torn document. Locks are no-ops: with
/// this backend the controller is the only writer.
pub struct FileStateStore {
    path: PathBuf,
    // Held so subscribers see a quiet channel instead of a closed one.
    external_tx: broadcast::Sender<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (external_tx, _) = broadcast::channel(4);
        Self {
            path: path.into(),
            external_tx,
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read_state(&self) -> Result<Option<StateDoc>> {
        let path = self.path.clone();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading state file"),
        };
        let doc: StateDoc = serde_json::from_str(&content)
            .with_context(|| format!("parsing state file {}", path.display()))?;
        Ok(Some(doc))
    }

    async fn write_state(&self, doc: &StateDoc) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let serialized = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension(format!("tmp-{:08x}", rand::random::<u32>()));
        tokio::fs::write(&tmp, &serialized)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming into {}", self.path.display()))?;

        info!(
            "store: file: state written, version={}, path={}",
            doc.version,
            self.path.display()
        );
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, _timeout: Option<Duration>) -> Result<LockLease> {
        Ok(LockLease {
            name: name.to_string(),
            lease_id: None,
        })
    }

    async fn release_lock(&self, _lease: LockLease) -> Result<()> {
        Ok(())
    }

    fn subscribe_external_change(&self) -> broadcast::Receiver<()> {
        self.external_tx.subscribe()
    }

    async fn healthy(&self) -> bool {
        true
    }
}
