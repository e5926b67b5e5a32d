pub mod acme;
pub mod dhparams;
pub mod selfsigned;
pub mod vault;

pub use acme::{AcmeClient, AcmeWorker, CertBundle, ChallengeResponder};
pub use vault::VaultClient;

use crate::error::StatikoError;
use crate::state::{StateManager, TlsCertificate};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Controller-side resolver: certificate id → (key_pem, cert_pem).
///
/// Dispatches on the stored variant. Self-signed material is (re)generated
/// whenever the stored blob fails validation; ACME entries serve a
/// self-signed placeholder until the obtain job lands a real certificate.
pub struct CertSource {
    manager: Arc<StateManager>,
    acme: Arc<AcmeWorker>,
    vault: Option<Arc<dyn VaultClient>>,
}

impl CertSource {
    pub fn new(
        manager: Arc<StateManager>,
        acme: Arc<AcmeWorker>,
        vault: Option<Arc<dyn VaultClient>>,
    ) -> Self {
        Self {
            manager,
            acme,
            vault,
        }
    }

    pub async fn get_certificate(&self, id: &str) -> Result<(String, String)> {
        let doc = self.manager.snapshot();
        let Some(cert) = doc.certificates.get(id) else {
            return Err(StatikoError::NotFound.into());
        };

        // Domains the certificate must cover: the union over every
        // referencing site.
        let mut domains: Vec<String> = Vec::new();
        for site in &doc.sites {
            if site.certificate_id().is_some_and(|c| c == id) {
                for d in site.sorted_domains() {
                    if !domains.contains(&d) {
                        domains.push(d);
                    }
                }
            }
        }
        domains.sort();

        match cert {
            TlsCertificate::Imported { blob, .. } => {
                let (key, cert) = self.manager.codec().decrypt_cert_pair(&blob.0)?;
                Ok((into_string(key)?, into_string(cert)?))
            }

            TlsCertificate::Vault { name, version } => match &self.vault {
                Some(vault) => vault.get_certificate(name, version.as_deref()).await,
                None => Err(StatikoError::Internal(format!(
                    "certificate {} requires a vault client, none configured",
                    id
                ))
                .into()),
            },

            TlsCertificate::SelfSigned { blob, .. } => {
                if !blob.is_empty() {
                    let (key, cert) = self.manager.codec().decrypt_cert_pair(&blob.0)?;
                    let check = if domains.is_empty() {
                        selfsigned::validate(&cert, None)
                    } else {
                        selfsigned::validate(&cert, Some(&domains))
                    };
                    match check {
                        Ok(()) => return Ok((into_string(key)?, into_string(cert)?)),
                        Err(reason) => {
                            info!("certs: self-signed {} invalid ({:?}), regenerating", id, reason)
                        }
                    }
                }
                if domains.is_empty() {
                    return Err(StatikoError::NotFound.into());
                }
                self.generate_and_store(id, &domains, false).await
            }

            TlsCertificate::Acme { blob, .. } => {
                if !blob.is_empty() {
                    let (key, cert) = self.manager.codec().decrypt_cert_pair(&blob.0)?;
                    if selfsigned::is_generated(&cert) {
                        // Placeholder from a previous request; the real
                        // certificate is still pending.
                        self.acme.queue_obtain(id);
                        return Ok((into_string(key)?, into_string(cert)?));
                    }
                    match selfsigned::validate(&cert, Some(&domains)) {
                        Ok(()) => return Ok((into_string(key)?, into_string(cert)?)),
                        Err(
                            selfsigned::ValidationFailure::Expiring
                            | selfsigned::ValidationFailure::NotYetValid,
                        ) => {
                            // Still serveable; renewal happens in the background.
                            self.acme.queue_obtain(id);
                            return Ok((into_string(key)?, into_string(cert)?));
                        }
                        Err(reason) => {
                            warn!(
                                "certs: issued certificate {} unusable ({:?}), falling back",
                                id, reason
                            );
                        }
                    }
                }
                if domains.is_empty() {
                    return Err(StatikoError::NotFound.into());
                }
                // First issuance (or unusable material): answer with a
                // self-signed fallback right away and let the obtain job
                // replace it.
                let pair = self.generate_and_store(id, &domains, true).await?;
                self.acme.queue_obtain(id);
                Ok(pair)
            }
        }
    }

    /// Direct vault lookup for sites whose TLS selector references the
    /// external vault by name instead of a stored certificate id.
    pub async fn get_vault_certificate(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<(String, String)> {
        match &self.vault {
            Some(vault) => vault.get_certificate(name, version).await,
            None => Err(StatikoError::Internal(
                "vault certificate requested but no vault client configured".to_string(),
            )
            .into()),
        }
    }

    async fn generate_and_store(
        &self,
        id: &str,
        domains: &[String],
        as_acme: bool,
    ) -> Result<(String, String)> {
        let domains = domains.to_vec();
        let (key_pem, cert_pem) =
            tokio::task::spawn_blocking(move || selfsigned::generate(&domains)).await??;

        let meta = selfsigned::parse(cert_pem.as_bytes()).map(|p| p.meta).ok();
        let stored = if as_acme {
            TlsCertificate::Acme {
                blob: Default::default(),
                meta,
            }
        } else {
            TlsCertificate::SelfSigned {
                blob: Default::default(),
                meta,
            }
        };
        self.manager
            .set_certificate(
                Some(id.to_string()),
                stored,
                Some((key_pem.clone().into_bytes(), cert_pem.clone().into_bytes())),
            )
            .await?;
        Ok((key_pem, cert_pem))
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| StatikoError::Corrupt.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::NodeRegistry;
    use crate::config::AcmeConfig;
    use crate::secrets::SecretCodec;
    use crate::state::file::FileStateStore;
    use crate::state::{Site, SiteTls};

    async fn source(dir: &tempfile::TempDir) -> (Arc<StateManager>, CertSource) {
        let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
        let manager = StateManager::load(store, SecretCodec::new([1u8; 16]))
            .await
            .unwrap();
        let registry = Arc::new(NodeRegistry::new(None));
        let (acme, _jobs) = AcmeWorker::new(
            manager.clone(),
            registry,
            None,
            AcmeConfig::default(),
        );
        (manager.clone(), CertSource::new(manager, acme, None))
    }

    #[tokio::test]
    async fn test_self_signed_generated_on_first_resolve_then_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, source) = source(&dir).await;

        manager
            .add_site(Site {
                domain: "a.example".to_string(),
                aliases: vec!["b.example".to_string()],
                ..Site::default()
            })
            .await
            .unwrap();
        let id = {
            let doc = manager.snapshot();
            doc.find_site("a.example")
                .unwrap()
                .certificate_id()
                .unwrap()
                .to_string()
        };

        let (key1, cert1) = source.get_certificate(&id).await.unwrap();
        assert!(key1.contains("PRIVATE KEY"));
        let parsed = selfsigned::parse(cert1.as_bytes()).unwrap();
        assert_eq!(parsed.meta.dns_names, vec!["a.example", "b.example"]);

        // Generation persisted the pair (one extra version bump), and a
        // second resolve serves the stored copy.
        let v = manager.version();
        let (_, cert2) = source.get_certificate(&id).await.unwrap();
        assert_eq!(cert1, cert2);
        assert_eq!(manager.version(), v);
    }

    #[tokio::test]
    async fn test_acme_resolves_to_placeholder_and_queues_job() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, source) = source(&dir).await;

        let mut site = Site {
            domain: "c.example".to_string(),
            ..Site::default()
        };
        site.tls = Some(SiteTls::Acme {
            certificate_id: String::new(),
        });
        manager.add_site(site).await.unwrap();
        let id = {
            let doc = manager.snapshot();
            doc.find_site("c.example")
                .unwrap()
                .certificate_id()
                .unwrap()
                .to_string()
        };

        let (_, cert) = source.get_certificate(&id).await.unwrap();
        assert!(selfsigned::is_generated(cert.as_bytes()));
        // The stored entry stays an ACME variant so renewal keeps chasing
        // the real certificate.
        assert!(matches!(
            manager.snapshot().certificates.get(&id),
            Some(TlsCertificate::Acme { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_, source) = source(&dir).await;
        let err = source.get_certificate("nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StatikoError>(),
            Some(StatikoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_vault_without_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, source) = source(&dir).await;
        manager
            .set_certificate(
                Some("kv-cert".to_string()),
                TlsCertificate::Vault {
                    name: "prod-kv".to_string(),
                    version: None,
                },
                None,
            )
            .await
            .unwrap();
        assert!(source.get_certificate("kv-cert").await.is_err());
    }
}
