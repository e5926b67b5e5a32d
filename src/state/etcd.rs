use crate::error::StatikoError;
use crate::etcd::EtcdClient;
use crate::state::store::{LockLease, StateStore};
use crate::state::{DhParams, EncryptedBlob, StateDoc};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Secrets larger than this stay out of the state document and get their
/// own key under `secrets/`, so the document key stays small enough for
/// comfortable watching.
const INLINE_SECRET_MAX: usize = 1024;

/// Poll interval while contending for a lock key.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Cluster backend over etcd. Layout under the configured prefix:
///
/// ```text
/// <prefix>/state           — the JSON state document (long secrets elided)
/// <prefix>/secrets/<k>     — base64 of each long encrypted secret
/// <prefix>/dhparams        — JSON DH parameters
/// <prefix>/locks/<name>    — leased lock keys
/// <prefix>/nodes/<member>  — heartbeat-renewed member keys
/// ```
pub struct EtcdStateStore {
    client: EtcdClient,
    prefix: String,
    member_id: String,
    lock_ttl: u64,
    node_ttl: u64,
    /// Highest revision returned by one of our own writes. Watch events at
    /// or below this are our own and do not count as external changes.
    last_write_revision: AtomicI64,
    external_tx: broadcast::Sender<()>,
}

impl EtcdStateStore {
    pub async fn connect(cfg: &crate::config::EtcdConfig) -> Result<Self> {
        let client = EtcdClient::connect(cfg).await?;
        info!("store: etcd: connected to {}", client.base_url());
        let (external_tx, _) = broadcast::channel(16);
        Ok(Self {
            client,
            prefix: cfg.key_prefix.trim_end_matches('/').to_string(),
            member_id: generate_member_id(),
            lock_ttl: cfg.lock_ttl_secs,
            node_ttl: cfg.node_ttl_secs,
            last_write_revision: AtomicI64::new(0),
            external_tx,
        })
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    fn state_key(&self) -> String {
        format!("{}/state", self.prefix)
    }

    fn secrets_prefix(&self) -> String {
        format!("{}/secrets/", self.prefix)
    }

    fn dhparams_key(&self) -> String {
        format!("{}/dhparams", self.prefix)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/locks/{}", self.prefix, name)
    }

    fn node_key(&self) -> String {
        format!("{}/nodes/{}", self.prefix, self.member_id)
    }

    fn record_write(&self, revision: i64) {
        self.last_write_revision.fetch_max(revision, Ordering::AcqRel);
    }

    // -- membership --------------------------------------------------------

    /// Register this member under a short-TTL lease. Returns the lease id;
    /// the caller owns the keepalive loop. When the lease expires the
    /// member disappears from the cluster.
    pub async fn register_member(&self) -> Result<i64> {
        let lease_id = self.client.lease_grant(self.node_ttl).await?;
        let value = serde_json::json!({
            "id": self.member_id,
            "registered_at": humantime::format_rfc3339_seconds(std::time::SystemTime::now())
                .to_string(),
        });
        let rev = self
            .client
            .put(&self.node_key(), &value.to_string(), Some(lease_id))
            .await?;
        self.record_write(rev);
        info!(
            "store: etcd: member registered, id={}, lease={}",
            self.member_id, lease_id
        );
        Ok(lease_id)
    }

    pub async fn member_keepalive(&self, lease_id: i64) -> Result<()> {
        self.client.lease_keepalive(lease_id).await
    }

    pub fn member_keepalive_interval(&self) -> Duration {
        Duration::from_secs((self.node_ttl / 3).max(1))
    }

    pub async fn unregister_member(&self, lease_id: i64) {
        if let Err(e) = self.client.lease_revoke(lease_id).await {
            warn!("store: etcd: member lease revoke failed: {}", e);
        }
    }

    // -- watching ----------------------------------------------------------

    /// One watch session over the state-bearing keys. Fires the external
    /// change signal for every revision strictly greater than our own last
    /// write. Returns when the stream ends; the caller loops with backoff.
    pub async fn watch_once(&self) {
        let prefix = format!("{}/", self.prefix);
        let locks = self.lock_key("");
        let nodes = format!("{}/nodes/", self.prefix);

        let mut stream = match self.client.watch(&prefix, true, None).await {
            Ok(s) => s,
            Err(e) => {
                warn!("store: etcd: watch connect failed: {}", e);
                return;
            }
        };

        while let Some(resp) = stream.next_response().await {
            let Some(result) = resp.result else { continue };
            let revision = result
                .header
                .as_ref()
                .and_then(|h| h.revision)
                .unwrap_or(0);

            // Lock churn and member heartbeats are operational noise, not
            // state changes.
            let state_event = result.events.iter().any(|ev| {
                ev.kv
                    .as_ref()
                    .and_then(|kv| crate::etcd::client::b64_decode(&kv.key).ok())
                    .map(|k| !k.starts_with(&locks) && !k.starts_with(&nodes))
                    .unwrap_or(false)
            });

            if state_event && revision > self.last_write_revision.load(Ordering::Acquire) {
                info!("store: etcd: external state change, revision={}", revision);
                let _ = self.external_tx.send(());
            }
        }
    }
}

fn generate_member_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "member".to_string());
    format!("{}-{:08x}", host, rand::random::<u32>())
}

#[async_trait]
impl StateStore for EtcdStateStore {
    async fn read_state(&self) -> Result<Option<StateDoc>> {
        let Some((raw, _rev)) = self.client.get(&self.state_key()).await? else {
            return Ok(None);
        };
        let mut doc: StateDoc = serde_json::from_str(&raw).context("parsing state document")?;

        // Merge long secrets back in.
        let secrets_prefix = self.secrets_prefix();
        let (entries, _) = self.client.get_prefix(&secrets_prefix).await?;
        for (key, value) in entries {
            let name = key.trim_start_matches(&secrets_prefix).to_string();
            match base64::engine::general_purpose::STANDARD.decode(value.as_bytes()) {
                Ok(bytes) => {
                    doc.secrets.insert(name, EncryptedBlob(bytes));
                }
                Err(e) => warn!("store: etcd: undecodable secret {}: {}", name, e),
            }
        }

        if let Some((raw, _)) = self.client.get(&self.dhparams_key()).await? {
            match serde_json::from_str::<DhParams>(&raw) {
                Ok(dh) => doc.dh_params = Some(dh),
                Err(e) => warn!("store: etcd: undecodable dhparams: {}", e),
            }
        }

        Ok(Some(doc))
    }

    async fn write_state(&self, doc: &StateDoc) -> Result<()> {
        let mut trimmed = doc.clone();

        // Long secrets get their own keys.
        let mut long: Vec<(String, String)> = Vec::new();
        trimmed.secrets.retain(|name, blob| {
            if blob.0.len() > INLINE_SECRET_MAX {
                long.push((
                    name.clone(),
                    base64::engine::general_purpose::STANDARD.encode(&blob.0),
                ));
                false
            } else {
                true
            }
        });
        let dh = trimmed.dh_params.take();

        let secrets_prefix = self.secrets_prefix();
        let existing: HashSet<String> = self
            .client
            .list_keys(&secrets_prefix)
            .await?
            .into_iter()
            .collect();
        let desired: HashSet<String> = long
            .iter()
            .map(|(name, _)| format!("{}{}", secrets_prefix, name))
            .collect();

        for stale in existing.difference(&desired) {
            let rev = self.client.delete(stale).await?;
            self.record_write(rev);
        }
        for (name, value) in &long {
            let rev = self
                .client
                .put(&format!("{}{}", secrets_prefix, name), value, None)
                .await?;
            self.record_write(rev);
        }

        match &dh {
            Some(dh) => {
                let rev = self
                    .client
                    .put(&self.dhparams_key(), &serde_json::to_string(dh)?, None)
                    .await?;
                self.record_write(rev);
            }
            None => {
                let rev = self.client.delete(&self.dhparams_key()).await?;
                self.record_write(rev);
            }
        }

        // The document goes last so its revision is the highest of the batch.
        let serialized = serde_json::to_string(&trimmed)?;
        let rev = self.client.put(&self.state_key(), &serialized, None).await?;
        self.record_write(rev);

        info!(
            "store: etcd: state written, version={}, revision={}",
            doc.version, rev
        );
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, timeout: Option<Duration>) -> Result<LockLease> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let lease_id = self.client.lease_grant(self.lock_ttl).await?;
        let key = self.lock_key(name);
        let value = format!(
            "{}|{}",
            self.member_id,
            humantime::format_rfc3339_seconds(std::time::SystemTime::now())
        );

        loop {
            match self.client.put_if_absent(&key, &value, Some(lease_id)).await {
                Ok(true) => {
                    return Ok(LockLease {
                        name: name.to_string(),
                        lease_id: Some(lease_id),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    self.unregister_lease(lease_id).await;
                    return Err(e);
                }
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                    self.unregister_lease(lease_id).await;
                    return Err(StatikoError::LockTimeout(name.to_string()).into());
                }
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release_lock(&self, lease: LockLease) -> Result<()> {
        let key = self.lock_key(&lease.name);
        if let Err(e) = self.client.delete(&key).await {
            warn!("store: etcd: lock delete failed, name={}: {}", lease.name, e);
        }
        if let Some(lease_id) = lease.lease_id {
            self.unregister_lease(lease_id).await;
        }
        Ok(())
    }

    fn subscribe_external_change(&self) -> broadcast::Receiver<()> {
        self.external_tx.subscribe()
    }

    async fn healthy(&self) -> bool {
        self.client.get(&self.state_key()).await.is_ok()
    }
}

impl EtcdStateStore {
    async fn unregister_lease(&self, lease_id: i64) {
        if let Err(e) = self.client.lease_revoke(lease_id).await {
            warn!("store: etcd: lease revoke failed: {}", e);
        }
    }
}
