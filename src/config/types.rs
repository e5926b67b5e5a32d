use serde::{Deserialize, Serialize};

/// Top-level configuration shared by both binaries. Role-specific sections
/// are ignored by the other role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name this node registers under. Defaults to the hostname.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Base64 of the 16-byte AES-128 master key (24 characters).
    /// Absence is a fatal startup error on the controller.
    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Static per-cluster options served to agents over the
    /// `cluster-options` RPC.
    #[serde(default)]
    pub cluster: ClusterOptionsConfig,
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "statiko-node".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "file" or "etcd".
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// State file path for the file backend.
    #[serde(default = "default_state_file")]
    pub file_path: String,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            file_path: default_state_file(),
            etcd: EtcdConfig::default(),
        }
    }
}

fn default_store_backend() -> String {
    "file".to_string()
}

fn default_state_file() -> String {
    "/var/lib/statiko/state.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default = "default_etcd_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Lease TTL for coarse locks.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Lease TTL for the member heartbeat key.
    #[serde(default = "default_node_ttl")]
    pub node_ttl_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            key_prefix: default_etcd_prefix(),
            username: None,
            password: None,
            lock_ttl_secs: default_lock_ttl(),
            node_ttl_secs: default_node_ttl(),
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_prefix() -> String {
    "/statiko".to_string()
}

fn default_lock_ttl() -> u64 {
    20
}

fn default_node_ttl() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_controller_listen")]
    pub listen: String,

    /// Shared bearer secret agents must present. Required.
    #[serde(default)]
    pub auth_token: String,

    /// PEM files for the channel listener. When unset a throwaway
    /// self-signed pair is generated at startup (development only).
    #[serde(default)]
    pub tls_cert_file: Option<String>,

    #[serde(default)]
    pub tls_key_file: Option<String>,

    #[serde(default)]
    pub acme: AcmeConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: default_controller_listen(),
            auth_token: String::new(),
            tls_cert_file: None,
            tls_key_file: None,
            acme: AcmeConfig::default(),
        }
    }
}

fn default_controller_listen() -> String {
    "0.0.0.0:2424".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Account email. ACME issuance is disabled when empty.
    #[serde(default)]
    pub email: String,

    /// Directory endpoint of the CA.
    #[serde(default = "default_acme_endpoint")]
    pub endpoint: String,
}

fn default_acme_endpoint() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the controller, e.g. "https://controller:2424".
    #[serde(default)]
    pub controller_address: String,

    #[serde(default)]
    pub auth_token: String,

    /// Root under which apps/, cache/ and sites/ live.
    #[serde(default = "default_app_root")]
    pub app_root: String,

    /// Extra CA bundle to trust for the controller connection.
    #[serde(default)]
    pub tls_ca_file: Option<String>,

    /// Skip controller certificate verification. Development only.
    #[serde(default)]
    pub tls_skip_verify: bool,

    #[serde(default)]
    pub nginx: NginxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            controller_address: String::new(),
            auth_token: String::new(),
            app_root: default_app_root(),
            tls_ca_file: None,
            tls_skip_verify: false,
            nginx: NginxConfig::default(),
        }
    }
}

fn default_app_root() -> String {
    "/var/lib/statiko".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxConfig {
    /// Directory the rendered server fragments are written into.
    #[serde(default = "default_nginx_conf_dir")]
    pub config_dir: String,

    #[serde(default = "default_nginx_status")]
    pub status_command: String,

    #[serde(default = "default_nginx_start")]
    pub start_command: String,

    #[serde(default = "default_nginx_restart")]
    pub restart_command: String,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            config_dir: default_nginx_conf_dir(),
            status_command: default_nginx_status(),
            start_command: default_nginx_start(),
            restart_command: default_nginx_restart(),
        }
    }
}

fn default_nginx_conf_dir() -> String {
    "/etc/nginx/conf.d".to_string()
}

fn default_nginx_status() -> String {
    "pgrep -x nginx".to_string()
}

fn default_nginx_start() -> String {
    "nginx".to_string()
}

fn default_nginx_restart() -> String {
    "nginx -s reload".to_string()
}

/// Served verbatim to agents over the `cluster-options` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOptionsConfig {
    /// Per-app manifest filename looked for at the bundle root.
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// PEM-encoded RSA public key bundles must be signed with.
    #[serde(default)]
    pub codesign_key_pem: Option<String>,

    #[serde(default)]
    pub repo: RepoConfig,

    #[serde(default)]
    pub notifications: Option<NotificationsConfig>,

    /// External vault name for vault-typed certificates.
    #[serde(default)]
    pub vault_name: Option<String>,
}

impl Default for ClusterOptionsConfig {
    fn default() -> Self {
        Self {
            manifest_file: default_manifest_file(),
            codesign_key_pem: None,
            repo: RepoConfig::default(),
            notifications: None,
            vault_name: None,
        }
    }
}

fn default_manifest_file() -> String {
    "statiko.yaml".to_string()
}

/// App bundle repository. Only the "local" kind is built in; object-storage
/// providers are wired by the embedding binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default = "default_repo_kind")]
    pub kind: String,

    /// Directory for the "local" kind.
    #[serde(default = "default_repo_path")]
    pub path: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            kind: default_repo_kind(),
            path: default_repo_path(),
        }
    }
}

fn default_repo_kind() -> String {
    "local".to_string()
}

fn default_repo_path() -> String {
    "/var/lib/statiko/repo".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// "webhook" is the only built-in method.
    #[serde(default = "default_notify_method")]
    pub method: String,

    #[serde(default)]
    pub webhook_url: String,

    /// Optional bearer token sent with webhook posts.
    #[serde(default)]
    pub webhook_key: Option<String>,
}

fn default_notify_method() -> String {
    "webhook".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert!(!cfg.node_name.is_empty());
        assert_eq!(cfg.store.backend, "file");
        assert_eq!(cfg.store.etcd.key_prefix, "/statiko");
        assert_eq!(cfg.store.etcd.lock_ttl_secs, 20);
        assert_eq!(cfg.store.etcd.node_ttl_secs, 15);
        assert_eq!(cfg.controller.listen, "0.0.0.0:2424");
        assert!(cfg.controller.acme.email.is_empty());
        assert_eq!(cfg.cluster.manifest_file, "statiko.yaml");
        assert_eq!(cfg.cluster.repo.kind, "local");
        assert!(cfg.cluster.notifications.is_none());
        assert!(!cfg.agent.tls_skip_verify);
        assert_eq!(cfg.agent.nginx.restart_command, "nginx -s reload");
    }

    #[test]
    fn test_minimal_toml() {
        let toml_src = r#"
            secret_key = "AAAAAAAAAAAAAAAAAAAAAA=="

            [agent]
            controller_address = "https://ctrl:2424"
            auth_token = "secret"
        "#;
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.agent.controller_address, "https://ctrl:2424");
        assert_eq!(cfg.agent.auth_token, "secret");
        assert_eq!(cfg.agent.app_root, "/var/lib/statiko");
    }

    #[test]
    fn test_notifications_json() {
        let json = r#"{
            "cluster": {
                "notifications": {"webhook_url": "https://hooks.example/x"}
            }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        let n = cfg.cluster.notifications.unwrap();
        assert_eq!(n.method, "webhook");
        assert_eq!(n.webhook_url, "https://hooks.example/x");
        assert!(n.webhook_key.is_none());
    }

    #[test]
    fn test_etcd_store_toml() {
        let toml_src = r#"
            [store]
            backend = "etcd"

            [store.etcd]
            endpoints = ["http://e1:2379", "http://e2:2379"]
            key_prefix = "/prod/statiko"
        "#;
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.store.backend, "etcd");
        assert_eq!(cfg.store.etcd.endpoints.len(), 2);
        assert_eq!(cfg.store.etcd.key_prefix, "/prod/statiko");
    }
}
