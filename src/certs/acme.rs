use crate::certs::selfsigned;
use crate::cluster::registry::NodeRegistry;
use crate::config::AcmeConfig;
use crate::state::{StateManager, TlsCertificate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Certificates closer than this to expiry get re-obtained.
pub const ACME_MIN_DAYS: i64 = 21;

/// How often the renewal scan walks the certificate map.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(3600);

/// State secret prefix holding pending HTTP-01 challenges, replicated to
/// every agent through the normal state push.
const CHALLENGE_PREFIX: &str = "acme/challenges/";

/// State secret prefix for the per-email account key and registration, so
/// controller restarts keep the same ACME identity.
const ACCOUNT_KEY_PREFIX: &str = "acme/account/";
const REGISTRATION_PREFIX: &str = "acme/registration/";

pub struct CertBundle {
    pub key_pem: String,
    pub cert_pem: String,
}

/// The ACME protocol driver is an external collaborator; the core hands it
/// the account material and a responder that replicates HTTP-01 challenges
/// cluster-wide before the CA is allowed to validate.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn obtain(
        &self,
        endpoint: &str,
        email: &str,
        account_key_pem: &str,
        domains: &[String],
        responder: &dyn ChallengeResponder,
    ) -> Result<CertBundle>;
}

#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    /// Make the key authorization available on every node, returning only
    /// once the whole cluster can serve it.
    async fn publish(&self, token: &str, domain: &str, key_auth: &str) -> Result<()>;

    async fn cleanup(&self, token: &str) -> Result<()>;
}

/// Challenge responder backed by state secrets and the registry's version
/// barrier.
pub struct StateChallengeResponder {
    manager: Arc<StateManager>,
    registry: Arc<NodeRegistry>,
}

impl StateChallengeResponder {
    pub fn new(manager: Arc<StateManager>, registry: Arc<NodeRegistry>) -> Self {
        Self { manager, registry }
    }
}

#[async_trait]
impl ChallengeResponder for StateChallengeResponder {
    async fn publish(&self, token: &str, domain: &str, key_auth: &str) -> Result<()> {
        let key = format!("{}{}", CHALLENGE_PREFIX, token);
        let value = format!("{}|{}", domain, key_auth);
        let version = self.manager.set_secret(&key, value.as_bytes()).await?;

        info!(
            "acme: challenge stored, domain={}, waiting for cluster at version {}",
            domain, version
        );
        // Every agent must have reconciled the challenge before the CA
        // probes an arbitrary node.
        self.registry.wait_for_version(version).await?;
        Ok(())
    }

    async fn cleanup(&self, token: &str) -> Result<()> {
        let key = format!("{}{}", CHALLENGE_PREFIX, token);
        self.manager.delete_secret(&key).await?;
        Ok(())
    }
}

/// Resolve a pending challenge token to its key authorization. Serves the
/// public (unauthenticated) challenge-response RPC; the domain must match
/// the one the challenge was stored for.
pub fn challenge_response(
    manager: &StateManager,
    token: &str,
    domain: &str,
) -> Result<Option<String>> {
    let key = format!("{}{}", CHALLENGE_PREFIX, token);
    let Some(raw) = manager.get_secret(&key)? else {
        return Ok(None);
    };
    let raw = String::from_utf8(raw).context("challenge secret is not UTF-8")?;
    let Some((stored_domain, key_auth)) = raw.split_once('|') else {
        anyhow::bail!("malformed challenge secret for token {}", token);
    };
    if stored_domain != domain {
        return Ok(None);
    }
    Ok(Some(key_auth.to_string()))
}

/// Load or create the ECDSA P-256 account key for an email, persisted as a
/// state secret.
pub async fn account_key(manager: &StateManager, email: &str) -> Result<String> {
    let key = format!("{}{}", ACCOUNT_KEY_PREFIX, email);
    if let Some(pem) = manager.get_secret(&key)? {
        let pem = String::from_utf8(pem).context("account key is not UTF-8")?;
        // Reject silently corrupted material rather than reusing it.
        p256::SecretKey::from_pkcs8_pem(&pem).context("stored account key is invalid")?;
        return Ok(pem);
    }

    let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
    let pem = secret
        .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
        .context("encoding account key")?
        .to_string();
    manager.set_secret(&key, pem.as_bytes()).await?;
    info!("acme: new account key generated, email={}", email);
    Ok(pem)
}

/// Stored account registration (the CA's JSON), if any.
pub fn registration(manager: &StateManager, email: &str) -> Result<Option<Vec<u8>>> {
    manager.get_secret(&format!("{}{}", REGISTRATION_PREFIX, email))
}

pub async fn store_registration(manager: &StateManager, email: &str, body: &[u8]) -> Result<()> {
    manager
        .set_secret(&format!("{}{}", REGISTRATION_PREFIX, email), body)
        .await?;
    Ok(())
}

/// Controller-side worker draining obtain jobs (certificate ids) and
/// running the periodic renewal scan.
pub struct AcmeWorker {
    manager: Arc<StateManager>,
    registry: Arc<NodeRegistry>,
    client: Option<Arc<dyn AcmeClient>>,
    config: AcmeConfig,
    jobs_tx: mpsc::UnboundedSender<String>,
    in_flight: Mutex<HashSet<String>>,
}

impl AcmeWorker {
    pub fn new(
        manager: Arc<StateManager>,
        registry: Arc<NodeRegistry>,
        client: Option<Arc<dyn AcmeClient>>,
        config: AcmeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                manager,
                registry,
                client,
                config,
                jobs_tx,
                in_flight: Mutex::new(HashSet::new()),
            }),
            jobs_rx,
        )
    }

    /// Queue an obtain job for a certificate id. Duplicate requests while a
    /// job is in flight are dropped.
    pub fn queue_obtain(&self, certificate_id: &str) {
        if self
            .in_flight
            .lock()
            .unwrap()
            .insert(certificate_id.to_string())
        {
            let _ = self.jobs_tx.send(certificate_id.to_string());
        }
    }

    pub fn enabled(&self) -> bool {
        self.client.is_some() && !self.config.email.is_empty()
    }

    /// Drain obtain jobs until the receiver closes or shutdown fires.
    pub async fn run(
        self: Arc<Self>,
        mut jobs_rx: mpsc::UnboundedReceiver<String>,
        shutdown: Arc<tokio::sync::Notify>,
    ) {
        loop {
            let id = tokio::select! {
                id = jobs_rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
                _ = shutdown.notified() => return,
            };

            if let Err(e) = self.obtain_one(&id).await {
                error!("acme: obtain failed, certificate={}, error={}", id, e);
            }
            self.in_flight.lock().unwrap().remove(&id);
        }
    }

    /// Periodic scan queueing renewal for issued certificates approaching
    /// expiry and for placeholders that never got issued.
    pub async fn run_renewal(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {}
                _ = shutdown.notified() => return,
            }
            self.scan_for_renewals();
        }
    }

    pub fn scan_for_renewals(&self) {
        let doc = self.manager.snapshot();
        let cutoff = OffsetDateTime::now_utc().unix_timestamp() + ACME_MIN_DAYS * 24 * 3600;

        for (id, cert) in &doc.certificates {
            let TlsCertificate::Acme { blob, .. } = cert else {
                continue;
            };
            // Renewal only matters while a non-temporary site uses the cert.
            let active = doc
                .sites
                .iter()
                .any(|s| !s.temporary && s.certificate_id().is_some_and(|c| c == id));
            if !active {
                continue;
            }

            if blob.is_empty() {
                self.queue_obtain(id);
                continue;
            }
            let Ok((_, cert_pem)) = self.manager.codec().decrypt_cert_pair(&blob.0) else {
                warn!("acme: undecryptable certificate {}, requeueing", id);
                self.queue_obtain(id);
                continue;
            };
            let needs_renewal = match selfsigned::parse(&cert_pem) {
                // Still the self-signed placeholder, or expiring soon.
                Ok(parsed) => {
                    selfsigned::is_generated(&cert_pem) || parsed.meta.not_after < cutoff
                }
                Err(_) => true,
            };
            if needs_renewal {
                info!("acme: certificate {} due for (re-)issuance", id);
                self.queue_obtain(id);
            }
        }
    }

    async fn obtain_one(&self, certificate_id: &str) -> Result<()> {
        let Some(client) = &self.client else {
            warn!("acme: no client wired, skipping obtain for {}", certificate_id);
            return Ok(());
        };
        if self.config.email.is_empty() {
            warn!("acme: no account email configured, skipping obtain");
            return Ok(());
        }

        let doc = self.manager.snapshot();
        let mut domains: Vec<String> = Vec::new();
        for site in &doc.sites {
            if site.certificate_id().is_some_and(|c| c == certificate_id) {
                for d in site.sorted_domains() {
                    if !domains.contains(&d) {
                        domains.push(d);
                    }
                }
            }
        }
        if domains.is_empty() {
            info!("acme: certificate {} no longer referenced, dropping job", certificate_id);
            return Ok(());
        }
        domains.sort();

        let account_key_pem = account_key(&self.manager, &self.config.email).await?;
        let responder = StateChallengeResponder::new(self.manager.clone(), self.registry.clone());

        info!(
            "acme: obtaining certificate, id={}, domains={}",
            certificate_id,
            domains.join(",")
        );
        let bundle = client
            .obtain(
                &self.config.endpoint,
                &self.config.email,
                &account_key_pem,
                &domains,
                &responder,
            )
            .await?;

        let meta = selfsigned::parse(bundle.cert_pem.as_bytes())
            .map(|p| p.meta)
            .ok();
        self.manager
            .set_certificate(
                Some(certificate_id.to_string()),
                TlsCertificate::Acme {
                    blob: Default::default(),
                    meta,
                },
                Some((bundle.key_pem.into_bytes(), bundle.cert_pem.into_bytes())),
            )
            .await?;

        info!("acme: certificate issued and stored, id={}", certificate_id);
        Ok(())
    }
}
