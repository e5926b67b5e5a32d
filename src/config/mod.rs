pub mod types;

pub use types::*;

use crate::error::StatikoError;
use anyhow::{Context, Result};
use base64::Engine;
use std::path::Path;

impl AppConfig {
    /// Load configuration from a file and apply environment variable
    /// overrides. A missing file is not an error: defaults plus the
    /// environment are enough to run a node.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?,
                Some("json") => serde_json::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?,
                other => anyhow::bail!(
                    "{} must end in .toml or .json (found {})",
                    path.display(),
                    other.map(|e| format!(".{e}")).unwrap_or_else(|| "none".to_string()),
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    "config: nothing at {}, starting from built-in defaults",
                    path.display()
                );
                AppConfig::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for connection and identity settings. Cluster
    /// state (sites, certificates, secrets) never comes from the
    /// environment — it lives in the state document.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STATIKO_NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("STATIKO_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Ok(v) = std::env::var("STATIKO_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Ok(v) = std::env::var("STATIKO_STORE_FILE") {
            self.store.file_path = v;
        }
        if let Ok(v) = std::env::var("STATIKO_ETCD_ENDPOINTS") {
            self.store.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("STATIKO_ETCD_PREFIX") {
            self.store.etcd.key_prefix = v;
        }
        if let Ok(v) = std::env::var("STATIKO_CONTROLLER_ADDRESS") {
            self.agent.controller_address = v;
        }
        if let Ok(v) = std::env::var("STATIKO_AUTH_TOKEN") {
            self.agent.auth_token = v.clone();
            self.controller.auth_token = v;
        }
        if let Ok(v) = std::env::var("STATIKO_APP_ROOT") {
            self.agent.app_root = v;
        }
        if let Ok(v) = std::env::var("STATIKO_ACME_EMAIL") {
            self.controller.acme.email = v;
        }
        if let Ok(v) = std::env::var("STATIKO_ACME_ENDPOINT") {
            self.controller.acme.endpoint = v;
        }
    }

    /// Decode the configured master key. The key protects every secret in
    /// the state document, so a missing or malformed key is fatal.
    pub fn master_key(&self) -> Result<[u8; 16], StatikoError> {
        if self.secret_key.is_empty() {
            return Err(StatikoError::BadKey);
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.secret_key.trim())
            .map_err(|_| StatikoError::BadKey)?;
        let key: [u8; 16] = raw.try_into().map_err(|_| StatikoError::BadKey)?;
        Ok(key)
    }

    /// Role-independent validation; each binary layers its own checks on top.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name cannot be empty");
        }
        match self.store.backend.as_str() {
            "file" | "etcd" => {}
            other => anyhow::bail!("unknown store backend: {other}, use \"file\" or \"etcd\""),
        }
        if self.store.backend == "etcd" && self.store.etcd.endpoints.is_empty() {
            anyhow::bail!("etcd backend selected but no endpoints configured");
        }
        Ok(())
    }

    /// Controller-side validation: master key and auth token are mandatory.
    pub fn validate_controller(&self) -> Result<()> {
        self.validate()?;
        self.master_key()?;
        if self.controller.auth_token.is_empty() {
            anyhow::bail!("controller.auth_token cannot be empty");
        }
        Ok(())
    }

    /// Agent-side validation.
    pub fn validate_agent(&self) -> Result<()> {
        self.validate()?;
        if self.agent.controller_address.is_empty() {
            anyhow::bail!("agent.controller_address cannot be empty");
        }
        if self.agent.auth_token.is_empty() {
            anyhow::bail!("agent.auth_token cannot be empty");
        }
        Ok(())
    }
}
