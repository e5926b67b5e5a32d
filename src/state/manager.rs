use crate::certs::dhparams::DEFAULT_DH_PARAMS;
use crate::error::StatikoError;
use crate::secrets::SecretCodec;
use crate::state::store::StateStore;
use crate::state::{DhParams, EncryptedBlob, Site, SiteTls, StateDoc, TlsCertificate, DEFAULT_SITE};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// How long writers wait for the store's `state` lock before giving up
/// with `LockTimeout`.
const STATE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Authoritative state owner on the controller.
///
/// Writers serialize on the store's `state` lock and bump `version` by
/// exactly one per successful mutation. Readers take the lock-free
/// in-memory snapshot and must tolerate it being superseded. The local
/// signaler only announces *that* state changed; subscribers fetch content
/// themselves.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    codec: SecretCodec,
    snapshot: ArcSwap<StateDoc>,
    changed_tx: broadcast::Sender<u64>,
    /// Serializes in-process writers. The store lock protects against
    /// other processes; the file backend's locks are no-ops.
    write_mu: tokio::sync::Mutex<()>,
}

impl StateManager {
    /// Load the persisted document (or start empty at version 0).
    pub async fn load(store: Arc<dyn StateStore>, codec: SecretCodec) -> Result<Arc<Self>> {
        let doc = store.read_state().await?.unwrap_or_default();
        info!("state: loaded, version={}", doc.version);
        let (changed_tx, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            store,
            codec,
            snapshot: ArcSwap::new(Arc::new(doc)),
            changed_tx,
            write_mu: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn snapshot(&self) -> Arc<StateDoc> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Subscribe to local change notifications; the payload is the new
    /// version.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Re-read the store after an external change (cluster backend only)
    /// and notify subscribers.
    pub async fn reload_from_store(&self) -> Result<()> {
        if let Some(doc) = self.store.read_state().await? {
            let version = doc.version;
            self.snapshot.store(Arc::new(doc));
            let _ = self.changed_tx.send(version);
            info!("state: reloaded after external change, version={}", version);
        }
        Ok(())
    }

    /// Run one mutation under the store lock. The closure sees the latest
    /// persisted document; the version bump and persistence are handled
    /// here. Returns the new version.
    async fn mutate<F>(&self, mutation: F) -> Result<u64>
    where
        F: FnOnce(&mut StateDoc) -> Result<()>,
    {
        let _writer = self.write_mu.lock().await;

        if !self.store.healthy().await {
            return Err(StatikoError::Internal("state store is not healthy".to_string()).into());
        }

        let lease = self
            .store
            .acquire_lock("state", Some(STATE_LOCK_TIMEOUT))
            .await?;

        let result = async {
            let mut doc = self
                .store
                .read_state()
                .await?
                .unwrap_or_else(|| (*self.snapshot.load_full()).clone());

            mutation(&mut doc)?;

            doc.version += 1;
            self.store
                .write_state(&doc)
                .await
                .context("persisting state")?;

            let version = doc.version;
            self.snapshot.store(Arc::new(doc));
            Ok::<u64, anyhow::Error>(version)
        }
        .await;

        self.store.release_lock(lease).await?;

        let version = result?;
        let _ = self.changed_tx.send(version);
        metrics::counter!("statiko_state_writes_total").increment(1);
        metrics::gauge!("statiko_state_version").set(version as f64);
        Ok(version)
    }

    // -- sites -------------------------------------------------------------

    /// Replace the whole document (admin bulk import). Site validation runs
    /// against the incoming set; orphaned cluster-managed certificates are
    /// purged.
    pub async fn replace(&self, incoming: StateDoc) -> Result<u64> {
        self.mutate(move |doc| {
            let mut replacement = incoming;

            // Per-site validation skips the site itself by domain, which
            // would also skip a duplicate; catch duplicates up front.
            let mut seen = std::collections::HashSet::new();
            for site in &replacement.sites {
                for name in std::iter::once(site.domain.as_str())
                    .chain(site.aliases.iter().map(String::as_str))
                {
                    if !seen.insert(name.to_string()) {
                        return Err(StatikoError::Validation(format!(
                            "domain {} appears more than once",
                            name
                        ))
                        .into());
                    }
                }
            }

            for i in 0..replacement.sites.len() {
                let site = replacement.sites[i].clone();
                validate_site(&replacement, &site, Some(&site.domain))?;
                ensure_certificate_binding(&mut replacement, i)?;
            }
            replacement.version = doc.version;
            purge_orphaned_certificates(&mut replacement);
            *doc = replacement;
            Ok(())
        })
        .await
    }

    pub async fn add_site(&self, site: Site) -> Result<u64> {
        self.mutate(move |doc| {
            validate_site(doc, &site, None)?;
            doc.sites.push(site);
            let idx = doc.sites.len() - 1;
            ensure_certificate_binding(doc, idx)?;
            Ok(())
        })
        .await
    }

    pub async fn update_site(&self, site: Site) -> Result<u64> {
        self.mutate(move |doc| {
            let Some(idx) = doc.sites.iter().position(|s| s.domain == site.domain) else {
                return Err(StatikoError::NotFound.into());
            };
            validate_site(doc, &site, Some(&site.domain))?;
            doc.sites[idx] = site;
            ensure_certificate_binding(doc, idx)?;
            purge_orphaned_certificates(doc);
            Ok(())
        })
        .await
    }

    pub async fn delete_site(&self, domain: &str) -> Result<u64> {
        let domain = domain.to_string();
        self.mutate(move |doc| {
            let before = doc.sites.len();
            doc.sites.retain(|s| s.domain != domain);
            if doc.sites.len() == before {
                return Err(StatikoError::NotFound.into());
            }
            purge_orphaned_certificates(doc);
            Ok(())
        })
        .await
    }

    // -- DH parameters -----------------------------------------------------

    pub async fn set_dh_params(&self, pem: String) -> Result<u64> {
        self.mutate(move |doc| {
            let trimmed = pem.trim();
            if trimmed.is_empty() || trimmed == DEFAULT_DH_PARAMS.trim() {
                return Err(StatikoError::Validation(
                    "DH parameters are empty or equal to the built-in default".to_string(),
                )
                .into());
            }
            if !trimmed.contains("BEGIN DH PARAMETERS") {
                return Err(
                    StatikoError::Validation("not a PEM DH parameters block".to_string()).into(),
                );
            }
            doc.dh_params = Some(DhParams {
                pem: trimmed.to_string(),
                generated_at: unix_now(),
            });
            Ok(())
        })
        .await
    }

    // -- secrets -----------------------------------------------------------

    /// Decrypt a secret from the current snapshot. Lock-free.
    pub fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let doc = self.snapshot.load();
        match doc.secrets.get(key) {
            Some(blob) => Ok(Some(self.codec.decrypt(&blob.0)?)),
            None => Ok(None),
        }
    }

    /// Encrypt and store a secret. Returns the new state version, which
    /// callers use as a replication barrier.
    pub async fn set_secret(&self, key: &str, value: &[u8]) -> Result<u64> {
        let encrypted = self.codec.encrypt(value)?;
        let key = key.to_string();
        self.mutate(move |doc| {
            doc.secrets.insert(key, EncryptedBlob(encrypted));
            Ok(())
        })
        .await
    }

    pub async fn delete_secret(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.mutate(move |doc| {
            if doc.secrets.remove(&key).is_none() {
                return Err(StatikoError::NotFound.into());
            }
            Ok(())
        })
        .await
    }

    // -- certificates ------------------------------------------------------

    /// Store a certificate. With `id` of `None` a fresh UUID is generated.
    /// When a PEM pair is given it is encrypted and attached to the stored
    /// object. Returns the id.
    pub async fn set_certificate(
        &self,
        id: Option<String>,
        mut certificate: TlsCertificate,
        pair: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<String> {
        let id = match id {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        if let Some((key_pem, cert_pem)) = pair {
            let encrypted = EncryptedBlob(self.codec.encrypt_cert_pair(&key_pem, &cert_pem)?);
            match &mut certificate {
                TlsCertificate::SelfSigned { blob, .. }
                | TlsCertificate::Acme { blob, .. }
                | TlsCertificate::Imported { blob, .. } => *blob = encrypted,
                TlsCertificate::Vault { .. } => {
                    return Err(StatikoError::Validation(
                        "vault certificates do not carry key material".to_string(),
                    )
                    .into());
                }
            }
        }

        validate_certificate(&certificate)?;

        let stored_id = id.clone();
        self.mutate(move |doc| {
            doc.certificates.insert(id, certificate);
            Ok(())
        })
        .await?;
        Ok(stored_id)
    }

    pub async fn delete_certificate(&self, id: &str) -> Result<u64> {
        let id = id.to_string();
        self.mutate(move |doc| {
            if doc.certificate_in_use(&id) {
                return Err(StatikoError::CertificateInUse(id.clone()).into());
            }
            if doc.certificates.remove(&id).is_none() {
                return Err(StatikoError::NotFound.into());
            }
            Ok(())
        })
        .await
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Admin-facing site validation. `skip_domain` exempts the site itself
/// from the uniqueness scan on updates/replaces.
fn validate_site(doc: &StateDoc, site: &Site, skip_domain: Option<&str>) -> Result<()> {
    if site.domain.is_empty() {
        return Err(StatikoError::Validation("site domain cannot be empty".to_string()).into());
    }
    if site.domain == DEFAULT_SITE {
        return Err(StatikoError::Validation(format!(
            "domain {} is reserved for the catch-all site",
            DEFAULT_SITE
        ))
        .into());
    }
    if site.aliases.iter().any(|a| a.is_empty() || a == DEFAULT_SITE) {
        return Err(
            StatikoError::Validation("aliases cannot be empty or the reserved domain".to_string())
                .into(),
        );
    }
    if site.aliases.iter().any(|a| *a == site.domain) {
        return Err(
            StatikoError::Validation("alias duplicates the primary domain".to_string()).into(),
        );
    }
    {
        let mut seen = std::collections::HashSet::new();
        for alias in &site.aliases {
            if !seen.insert(alias.as_str()) {
                return Err(
                    StatikoError::Validation(format!("duplicate alias: {}", alias)).into(),
                );
            }
        }
    }

    let mut incoming: Vec<&str> = vec![site.domain.as_str()];
    incoming.extend(site.aliases.iter().map(String::as_str));

    for other in &doc.sites {
        if skip_domain.is_some_and(|d| d == other.domain) {
            continue;
        }
        for name in std::iter::once(other.domain.as_str()).chain(other.aliases.iter().map(String::as_str)) {
            if incoming.contains(&name) {
                return Err(StatikoError::Validation(format!(
                    "domain {} is already served by site {}",
                    name, other.domain
                ))
                .into());
            }
        }
    }

    Ok(())
}

/// Make the site at `idx` satisfy the certificate invariant: cluster-owned
/// selectors without an id get a fresh placeholder entry; imported ids must
/// already exist.
fn ensure_certificate_binding(doc: &mut StateDoc, idx: usize) -> Result<()> {
    let tls = doc.sites[idx].tls.clone();
    match tls {
        // No explicit choice: default to a cluster-generated self-signed
        // certificate so every site can terminate TLS.
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.certificates.insert(
                id.clone(),
                TlsCertificate::SelfSigned {
                    blob: EncryptedBlob::default(),
                    meta: None,
                },
            );
            doc.sites[idx].tls = Some(SiteTls::SelfSigned { certificate_id: id });
        }
        Some(SiteTls::SelfSigned { certificate_id }) if certificate_id.is_empty() => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.certificates.insert(
                id.clone(),
                TlsCertificate::SelfSigned {
                    blob: EncryptedBlob::default(),
                    meta: None,
                },
            );
            doc.sites[idx].tls = Some(SiteTls::SelfSigned { certificate_id: id });
        }
        Some(SiteTls::Acme { certificate_id }) if certificate_id.is_empty() => {
            let id = uuid::Uuid::new_v4().to_string();
            doc.certificates.insert(
                id.clone(),
                TlsCertificate::Acme {
                    blob: EncryptedBlob::default(),
                    meta: None,
                },
            );
            doc.sites[idx].tls = Some(SiteTls::Acme { certificate_id: id });
        }
        Some(SiteTls::SelfSigned { certificate_id })
        | Some(SiteTls::Acme { certificate_id })
        | Some(SiteTls::Imported { certificate_id }) => {
            if !doc.certificates.contains_key(&certificate_id) {
                return Err(StatikoError::Validation(format!(
                    "referenced certificate does not exist: {}",
                    certificate_id
                ))
                .into());
            }
        }
        Some(SiteTls::Vault { name, .. }) => {
            if name.is_empty() {
                return Err(
                    StatikoError::Validation("vault certificate name cannot be empty".to_string())
                        .into(),
                );
            }
        }
    }
    Ok(())
}

/// Drop self-signed and ACME certificates no site references anymore.
/// Imported and vault entries are admin-owned and stay.
fn purge_orphaned_certificates(doc: &mut StateDoc) {
    let referenced: std::collections::HashSet<String> = doc
        .sites
        .iter()
        .filter_map(|s| s.certificate_id().map(String::from))
        .collect();
    doc.certificates
        .retain(|id, cert| !cert.is_cluster_managed() || referenced.contains(id));
}

fn validate_certificate(cert: &TlsCertificate) -> Result<()> {
    match cert {
        TlsCertificate::Imported { blob, .. } => {
            if blob.is_empty() {
                return Err(StatikoError::Validation(
                    "imported certificates require key material".to_string(),
                )
                .into());
            }
        }
        TlsCertificate::Vault { name, .. } => {
            if name.is_empty() {
                return Err(
                    StatikoError::Validation("vault certificate name cannot be empty".to_string())
                        .into(),
                );
            }
        }
        TlsCertificate::SelfSigned { .. } | TlsCertificate::Acme { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::file::FileStateStore;

    async fn manager(dir: &tempfile::TempDir) -> Arc<StateManager> {
        let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
        StateManager::load(store, SecretCodec::new([1u8; 16]))
            .await
            .unwrap()
    }

    fn site(domain: &str, aliases: &[&str]) -> Site {
        Site {
            domain: domain.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            ..Site::default()
        }
    }

    #[tokio::test]
    async fn test_every_mutation_bumps_version_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        assert_eq!(m.version(), 0);

        assert_eq!(m.add_site(site("a.example", &[])).await.unwrap(), 1);
        assert_eq!(m.set_secret("k", b"v").await.unwrap(), 2);
        assert_eq!(m.delete_secret("k").await.unwrap(), 3);
        assert_eq!(m.delete_site("a.example").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_add_site_defaults_to_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.add_site(site("a.example", &["b.example"])).await.unwrap();

        let doc = m.snapshot();
        let s = doc.find_site("a.example").unwrap();
        let id = s.certificate_id().unwrap();
        assert!(matches!(
            doc.certificates.get(id),
            Some(TlsCertificate::SelfSigned { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_domains_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.add_site(site("a.example", &["b.example"])).await.unwrap();

        // Same primary, alias of an existing site, and reserved name.
        assert!(m.add_site(site("a.example", &[])).await.is_err());
        assert!(m.add_site(site("b.example", &[])).await.is_err());
        assert!(m.add_site(site("c.example", &["a.example"])).await.is_err());
        assert!(m.add_site(site("_default", &[])).await.is_err());
        assert_eq!(m.version(), 1);
    }

    #[tokio::test]
    async fn test_delete_site_purges_orphaned_managed_cert() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.add_site(site("a.example", &[])).await.unwrap();

        let id = {
            let doc = m.snapshot();
            doc.find_site("a.example")
                .unwrap()
                .certificate_id()
                .unwrap()
                .to_string()
        };
        m.delete_site("a.example").await.unwrap();
        assert!(!m.snapshot().certificates.contains_key(&id));
    }

    #[tokio::test]
    async fn test_imported_cert_survives_site_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        let id = m
            .set_certificate(
                None,
                TlsCertificate::Imported {
                    blob: EncryptedBlob::default(),
                    meta: None,
                },
                Some((b"KEY".to_vec(), b"CERT".to_vec())),
            )
            .await
            .unwrap();

        let mut s = site("a.example", &[]);
        s.tls = Some(SiteTls::Imported {
            certificate_id: id.clone(),
        });
        m.add_site(s).await.unwrap();
        m.delete_site("a.example").await.unwrap();
        assert!(m.snapshot().certificates.contains_key(&id));
    }

    #[tokio::test]
    async fn test_delete_certificate_in_use_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.add_site(site("a.example", &[])).await.unwrap();
        let id = {
            let doc = m.snapshot();
            doc.find_site("a.example")
                .unwrap()
                .certificate_id()
                .unwrap()
                .to_string()
        };
        let err = m.delete_certificate(&id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StatikoError>(),
            Some(StatikoError::CertificateInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_secret_roundtrip_is_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.set_secret("token", b"hunter2").await.unwrap();

        assert_eq!(m.get_secret("token").unwrap().unwrap(), b"hunter2");
        assert!(m.get_secret("absent").unwrap().is_none());

        let stored = &m.snapshot().secrets["token"];
        assert_ne!(stored.0.as_slice(), b"hunter2");
    }

    #[tokio::test]
    async fn test_dh_params_validation() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        assert!(m.set_dh_params(String::new()).await.is_err());
        assert!(m.set_dh_params(DEFAULT_DH_PARAMS.to_string()).await.is_err());
        assert!(m.set_dh_params("garbage".to_string()).await.is_err());

        let custom = "-----BEGIN DH PARAMETERS-----\nMIIBCAKCAQEA\n-----END DH PARAMETERS-----";
        m.set_dh_params(custom.to_string()).await.unwrap();
        assert_eq!(m.snapshot().dh_params.as_ref().unwrap().pem, custom);
    }

    #[tokio::test]
    async fn test_replace_purges_orphans_and_keeps_version_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        m.add_site(site("a.example", &[])).await.unwrap();
        m.add_site(site("b.example", &[])).await.unwrap();
        assert_eq!(m.version(), 2);

        m.replace(StateDoc::default()).await.unwrap();
        let doc = m.snapshot();
        assert_eq!(doc.version, 3);
        assert!(doc.sites.is_empty());
        assert!(doc.certificates.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).await;
        let mut rx = m.subscribe();
        m.add_site(site("a.example", &[])).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), 1);
    }
}
