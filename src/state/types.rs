use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved pseudo-domain of the catch-all site.
pub const DEFAULT_SITE: &str = "_default";

/// Encrypted bytes embedded in the state document, serialized as base64 so
/// the JSON form stays readable and diffable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedBlob(pub Vec<u8>);

impl Serialize for EncryptedBlob {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EncryptedBlob {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine;
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(EncryptedBlob)
            .map_err(serde::de::Error::custom)
    }
}

impl EncryptedBlob {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The single versioned value describing the desired configuration of the
/// whole cluster. `version` is strictly monotonic across successful writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDoc {
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub sites: Vec<Site>,

    /// Certificate id → stored certificate.
    #[serde(default)]
    pub certificates: HashMap<String, TlsCertificate>,

    /// Secret key → encrypted bytes (nonce ∥ AES-128-GCM ciphertext).
    #[serde(default)]
    pub secrets: HashMap<String, EncryptedBlob>,

    #[serde(default)]
    pub dh_params: Option<DhParams>,
}

impl StateDoc {
    /// Look up a site by primary domain or alias.
    pub fn find_site(&self, domain: &str) -> Option<&Site> {
        self.sites
            .iter()
            .find(|s| s.domain == domain || s.aliases.iter().any(|a| a == domain))
    }

    /// True when any site references the certificate id.
    pub fn certificate_in_use(&self, id: &str) -> bool {
        self.sites
            .iter()
            .any(|s| s.certificate_id().is_some_and(|c| c == id))
    }

    /// Every domain served by the cluster (primaries and aliases).
    pub fn all_domains(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for site in &self.sites {
            out.push(site.domain.as_str());
            out.extend(site.aliases.iter().map(String::as_str));
        }
        out
    }
}

/// One virtual host: a primary domain, optional aliases, optional TLS
/// selection and an optional app bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    /// Temporary sites are skipped by certificate renewal.
    #[serde(default)]
    pub temporary: bool,

    #[serde(default)]
    pub tls: Option<SiteTls>,

    /// Name of the app bundle serving this site, if any.
    #[serde(default)]
    pub app: Option<String>,
}

impl Site {
    /// Certificate id this site references in the certificate map, if the
    /// selector carries one.
    pub fn certificate_id(&self) -> Option<&str> {
        match &self.tls {
            Some(SiteTls::SelfSigned { certificate_id })
            | Some(SiteTls::Acme { certificate_id })
            | Some(SiteTls::Imported { certificate_id }) => {
                if certificate_id.is_empty() {
                    None
                } else {
                    Some(certificate_id)
                }
            }
            Some(SiteTls::Vault { .. }) | None => None,
        }
    }

    /// All DNS names this site answers for, sorted.
    pub fn sorted_domains(&self) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(self.domain.clone())
            .chain(self.aliases.iter().cloned())
            .collect();
        names.sort();
        names
    }
}

/// How a site obtains TLS material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SiteTls {
    SelfSigned {
        #[serde(default)]
        certificate_id: String,
    },
    Acme {
        #[serde(default)]
        certificate_id: String,
    },
    Imported { certificate_id: String },
    Vault {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

/// Stored certificate. The first three variants carry an encrypted
/// key/cert pair; the vault variant is only a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TlsCertificate {
    SelfSigned {
        #[serde(default)]
        blob: EncryptedBlob,
        #[serde(default)]
        meta: Option<CertMeta>,
    },
    Acme {
        #[serde(default)]
        blob: EncryptedBlob,
        #[serde(default)]
        meta: Option<CertMeta>,
    },
    Imported {
        blob: EncryptedBlob,
        #[serde(default)]
        meta: Option<CertMeta>,
    },
    Vault {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

impl TlsCertificate {
    pub fn blob(&self) -> Option<&EncryptedBlob> {
        match self {
            TlsCertificate::SelfSigned { blob, .. }
            | TlsCertificate::Acme { blob, .. }
            | TlsCertificate::Imported { blob, .. } => {
                if blob.is_empty() {
                    None
                } else {
                    Some(blob)
                }
            }
            TlsCertificate::Vault { .. } => None,
        }
    }

    pub fn meta(&self) -> Option<&CertMeta> {
        match self {
            TlsCertificate::SelfSigned { meta, .. }
            | TlsCertificate::Acme { meta, .. }
            | TlsCertificate::Imported { meta, .. } => meta.as_ref(),
            TlsCertificate::Vault { .. } => None,
        }
    }

    /// Self-signed and ACME certificates are owned by the cluster and get
    /// purged when the last referencing site goes away.
    pub fn is_cluster_managed(&self) -> bool {
        matches!(
            self,
            TlsCertificate::SelfSigned { .. } | TlsCertificate::Acme { .. }
        )
    }
}

/// Cached parse results so listing certificates does not require decryption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertMeta {
    #[serde(default)]
    pub dns_names: Vec<String>,

    /// Unix seconds.
    #[serde(default)]
    pub not_before: i64,

    #[serde(default)]
    pub not_after: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhParams {
    pub pem: String,

    /// Unix seconds of generation/import.
    pub generated_at: i64,
}

// ---------------------------------------------------------------------------
// Channel frames and health reporting.
// ---------------------------------------------------------------------------

/// Frames sent agent → controller, newline-delimited JSON on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    RegisterNode { node_name: String },
    Health(NodeHealth),
}

/// Frames sent controller → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ok,
    Error { message: String },
    State(StateDoc),
    HealthPing,
}

/// A node's typed health reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeHealth {
    #[serde(default)]
    pub node_name: String,

    /// Highest state version this node has fully reconciled.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub nginx_running: bool,

    /// Unix seconds of the last sync attempt.
    #[serde(default)]
    pub last_sync_time: Option<i64>,

    #[serde(default)]
    pub last_sync_error: Option<String>,

    #[serde(default)]
    pub sites: Vec<SiteHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteHealth {
    pub domain: String,

    #[serde(default)]
    pub error: Option<String>,
}
