pub mod nginx;
pub mod process;

pub use process::NginxControl;

use crate::apps::AppFetcher;
use crate::certs::dhparams::DEFAULT_DH_PARAMS;
use crate::secrets::SecretCodec;
use crate::state::{Site, StateDoc, StateMirror, DEFAULT_SITE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Welcome content served by the catch-all site until an app is deployed.
const WELCOME_PAGE: &str = "<!DOCTYPE html>
<html>
<head><title>Welcome to statiko</title></head>
<body>
<h1>It works</h1>
<p>This node is managed by statiko. Deploy a site to replace this page.</p>
</body>
</html>
";

/// Prefix under which pending HTTP-01 challenges live in the state secrets.
const CHALLENGE_SECRET_PREFIX: &str = "acme/challenges/";

/// How the agent obtains TLS material for a site; the implementation asks
/// the controller over the RPC channel.
#[async_trait]
pub trait CertificateResolver: Send + Sync {
    async fn resolve(&self, site: &Site) -> Result<(String, String)>;
}

/// Computes the desired `sites/` tree and proxy configuration from a state
/// document and swaps files atomically. Idempotent: a second pass over the
/// same state changes nothing and reports no restart.
pub struct WebServer {
    root: PathBuf,
    control: NginxControl,
    mirror: Arc<StateMirror>,
    certs: Arc<dyn CertificateResolver>,
    apps: Arc<AppFetcher>,
    codec: SecretCodec,
}

impl WebServer {
    pub fn new(
        root: impl Into<PathBuf>,
        control: NginxControl,
        mirror: Arc<StateMirror>,
        certs: Arc<dyn CertificateResolver>,
        apps: Arc<AppFetcher>,
        codec: SecretCodec,
    ) -> Self {
        Self {
            root: root.into(),
            control,
            mirror,
            certs,
            apps,
            codec,
        }
    }

    pub fn control(&self) -> &NginxControl {
        &self.control
    }

    /// Render the full desired tree. Returns whether the proxy needs a
    /// restart to pick up changed configuration.
    pub async fn reconcile(&self, doc: &StateDoc) -> Result<bool> {
        let sites_dir = self.root.join("sites");
        tokio::fs::create_dir_all(&sites_dir).await?;

        // The catch-all content is re-materialized on every sync.
        let default_dir = self.root.join("apps").join(DEFAULT_SITE);
        tokio::fs::create_dir_all(&default_dir).await?;
        write_if_changed(&default_dir.join("index.html"), WELCOME_PAGE.as_bytes()).await?;

        let desired: HashSet<&str> = doc.sites.iter().map(|s| s.domain.as_str()).collect();

        // Site directories that no longer correspond to a site go away.
        let mut entries = tokio::fs::read_dir(&sites_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !desired.contains(name.as_str()) {
                tokio::fs::remove_dir_all(entry.path()).await?;
                info!("web: removed site directory, domain={}", name);
            }
        }

        let mut restart = false;
        let mut fragments: HashMap<String, String> = HashMap::new();
        let mut keep_existing: HashSet<String> = HashSet::new();

        for site in &doc.sites {
            match self.render_site(doc, site).await {
                Ok(tls_changed) => {
                    restart |= tls_changed;
                    let manifest = site.app.as_deref().and_then(|a| self.apps.manifest_for(a));
                    fragments.insert(
                        format!("{}.conf", site.domain),
                        nginx::site_fragment(site, manifest.as_ref(), &self.root),
                    );
                }
                Err(e) => {
                    warn!("web: site render failed, domain={}, error={:#}", site.domain, e);
                    self.mirror
                        .set_site_health(&site.domain, Some(format!("{:#}", e)));
                    // Leave whatever fragment is already on disk alone so a
                    // transient certificate error does not take the site down.
                    keep_existing.insert(format!("{}.conf", site.domain));
                }
            }
        }
        fragments.insert(
            format!("{}.conf", DEFAULT_SITE),
            nginx::default_fragment(&self.root),
        );

        restart |= self.write_fragments(&fragments, &keep_existing).await?;

        // A freshly started proxy reads the new configuration anyway.
        if self.control.ensure_running().await? {
            restart = false;
        }
        Ok(restart)
    }

    /// Per-site files: tls material, the www symlink, and any pending ACME
    /// challenge files. Returns whether TLS content changed.
    async fn render_site(&self, doc: &StateDoc, site: &Site) -> Result<bool> {
        let site_dir = self.root.join("sites").join(&site.domain);
        let tls_dir = site_dir.join("tls");
        tokio::fs::create_dir_all(&tls_dir).await?;

        let (key_pem, cert_pem) = self
            .certs
            .resolve(site)
            .await
            .context("resolving TLS certificate")?;

        let mut changed = false;
        changed |= write_if_changed(&tls_dir.join("certificate.pem"), cert_pem.as_bytes()).await?;
        changed |= write_if_changed(&tls_dir.join("key.pem"), key_pem.as_bytes()).await?;
        let dh = doc
            .dh_params
            .as_ref()
            .map(|d| d.pem.as_str())
            .unwrap_or(DEFAULT_DH_PARAMS);
        changed |= write_if_changed(&tls_dir.join("dhparams.pem"), dh.as_bytes()).await?;

        let app_dir = site.app.as_deref().unwrap_or(DEFAULT_SITE);
        replace_symlink(
            &site_dir.join("www"),
            &PathBuf::from("../../apps").join(app_dir),
        )
        .await?;

        self.render_challenges(doc, site, &site_dir).await?;
        Ok(changed)
    }

    /// Materialize this site's pending HTTP-01 challenges under
    /// `acme/.well-known/acme-challenge/<token>`. The directory is rebuilt
    /// from scratch so completed challenges disappear.
    async fn render_challenges(&self, doc: &StateDoc, site: &Site, site_dir: &Path) -> Result<()> {
        let acme_root = site_dir.join("acme");
        let _ = tokio::fs::remove_dir_all(&acme_root).await;

        let own_domains = site.sorted_domains();
        for (secret_key, blob) in &doc.secrets {
            let Some(token) = secret_key.strip_prefix(CHALLENGE_SECRET_PREFIX) else {
                continue;
            };
            let Ok(raw) = self.codec.decrypt(&blob.0) else {
                warn!("web: undecryptable challenge secret, token={}", token);
                continue;
            };
            let Ok(raw) = String::from_utf8(raw) else { continue };
            let Some((domain, key_auth)) = raw.split_once('|') else {
                continue;
            };
            if !own_domains.iter().any(|d| d == domain) {
                continue;
            }

            let challenge_dir = acme_root.join(".well-known/acme-challenge");
            tokio::fs::create_dir_all(&challenge_dir).await?;
            tokio::fs::write(challenge_dir.join(token), key_auth).await?;
            info!(
                "web: challenge materialized, domain={}, token={}",
                domain, token
            );
        }
        Ok(())
    }

    /// Write changed fragments and delete stale ones. Byte-compares against
    /// the on-disk content so untouched configuration never triggers a
    /// restart.
    async fn write_fragments(
        &self,
        fragments: &HashMap<String, String>,
        keep_existing: &HashSet<String>,
    ) -> Result<bool> {
        let config_dir = PathBuf::from(self.control.config_dir());
        tokio::fs::create_dir_all(&config_dir).await?;

        let mut restart = false;
        for (name, content) in fragments {
            if write_if_changed(&config_dir.join(name), content.as_bytes()).await? {
                info!("web: config fragment updated, file={}", name);
                restart = true;
            }
        }

        let mut entries = tokio::fs::read_dir(&config_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".conf")
                || fragments.contains_key(&name)
                || keep_existing.contains(&name)
            {
                continue;
            }
            tokio::fs::remove_file(entry.path()).await?;
            info!("web: config fragment removed, file={}", name);
            restart = true;
        }
        Ok(restart)
    }
}

/// Temp-write-plus-rename, skipped when the on-disk bytes already match.
/// Returns whether the file changed.
async fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) | Err(_) => {}
    }
    let tmp = path.with_extension(format!("tmp-{:08x}", rand::random::<u32>()));
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(true)
}

/// Atomically point `link` at `target` (write a sibling, then rename).
async fn replace_symlink(link: &Path, target: &Path) -> Result<()> {
    if let Ok(current) = tokio::fs::read_link(link).await {
        if current == target {
            return Ok(());
        }
    }
    let tmp = link.with_extension("tmp-link");
    let _ = tokio::fs::remove_file(&tmp).await;
    tokio::fs::symlink(target, &tmp)
        .await
        .with_context(|| format!("creating symlink {}", tmp.display()))?;
    tokio::fs::rename(&tmp, link)
        .await
        .with_context(|| format!("renaming symlink into {}", link.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::LocalStorage;
    use crate::config::NginxConfig;
    use crate::state::EncryptedBlob;

    struct StaticResolver;

    #[async_trait]
    impl CertificateResolver for StaticResolver {
        async fn resolve(&self, _site: &Site) -> Result<(String, String)> {
            Ok(("KEY-PEM".to_string(), "CERT-PEM".to_string()))
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl CertificateResolver for FailingResolver {
        async fn resolve(&self, _site: &Site) -> Result<(String, String)> {
            anyhow::bail!("controller unreachable")
        }
    }

    fn webserver(
        dir: &tempfile::TempDir,
        resolver: Arc<dyn CertificateResolver>,
    ) -> (WebServer, Arc<StateMirror>, PathBuf) {
        let root = dir.path().join("root");
        let conf_dir = dir.path().join("conf.d");
        let mirror = Arc::new(StateMirror::new());
        let codec = SecretCodec::new([1u8; 16]);
        let apps = Arc::new(
            AppFetcher::new(
                &root,
                Arc::new(LocalStorage::new(dir.path().join("repo"))),
                None,
                "statiko.yaml",
                mirror.clone(),
            )
            .unwrap(),
        );
        let control = NginxControl::new(NginxConfig {
            config_dir: conf_dir.to_string_lossy().to_string(),
            status_command: "true".to_string(),
            start_command: "true".to_string(),
            restart_command: "true".to_string(),
        });
        (
            WebServer::new(&root, control, mirror.clone(), resolver, apps, codec),
            mirror,
            root,
        )
    }

    fn doc(domains: &[&str]) -> StateDoc {
        StateDoc {
            version: 1,
            sites: domains
                .iter()
                .map(|d| Site {
                    domain: d.to_string(),
                    ..Site::default()
                })
                .collect(),
            ..StateDoc::default()
        }
    }

    #[tokio::test]
    async fn test_reconcile_builds_tree_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (web, _mirror, root) = webserver(&dir, Arc::new(StaticResolver));
        let state = doc(&["a.example"]);

        let restart = web.reconcile(&state).await.unwrap();
        assert!(restart);

        let site_dir = root.join("sites/a.example");
        assert_eq!(
            std::fs::read_to_string(site_dir.join("tls/certificate.pem")).unwrap(),
            "CERT-PEM"
        );
        assert_eq!(
            std::fs::read_to_string(site_dir.join("tls/key.pem")).unwrap(),
            "KEY-PEM"
        );
        assert!(std::fs::read_to_string(site_dir.join("tls/dhparams.pem"))
            .unwrap()
            .contains("DH PARAMETERS"));
        let www = std::fs::read_link(site_dir.join("www")).unwrap();
        assert_eq!(www, PathBuf::from("../../apps/_default"));
        assert!(root.join("apps/_default/index.html").exists());
        assert!(dir.path().join("conf.d/a.example.conf").exists());
        assert!(dir.path().join("conf.d/_default.conf").exists());

        // Second pass over identical state: nothing changes.
        assert!(!web.reconcile(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_site_removal_cleans_tree_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let (web, _mirror, root) = webserver(&dir, Arc::new(StaticResolver));

        web.reconcile(&doc(&["a.example", "b.example"])).await.unwrap();
        let restart = web.reconcile(&doc(&["a.example"])).await.unwrap();
        assert!(restart);
        assert!(!root.join("sites/b.example").exists());
        assert!(!dir.path().join("conf.d/b.example.conf").exists());
        assert!(dir.path().join("conf.d/a.example.conf").exists());
    }

    #[tokio::test]
    async fn test_resolver_failure_marks_site_and_keeps_fragment() {
        let dir = tempfile::tempdir().unwrap();

        // First converge successfully, then flip to a failing resolver.
        let (web, _mirror, _) = webserver(&dir, Arc::new(StaticResolver));
        web.reconcile(&doc(&["a.example"])).await.unwrap();

        let (web, mirror, _) = webserver(&dir, Arc::new(FailingResolver));
        mirror.replace_state(doc(&["a.example"]));
        mirror.reset_site_health();
        web.reconcile(&doc(&["a.example"])).await.unwrap();

        assert!(mirror
            .get_site_health("a.example")
            .unwrap()
            .contains("controller unreachable"));
        assert!(dir.path().join("conf.d/a.example.conf").exists());
    }

    #[tokio::test]
    async fn test_challenge_files_materialized() {
        let dir = tempfile::tempdir().unwrap();
        let (web, _mirror, root) = webserver(&dir, Arc::new(StaticResolver));
        let codec = SecretCodec::new([1u8; 16]);

        let mut state = doc(&["c.example"]);
        state.secrets.insert(
            "acme/challenges/tok123".to_string(),
            EncryptedBlob(codec.encrypt(b"c.example|tok123.keyauth").unwrap()),
        );
        // A challenge for some other site's domain is not materialized here.
        state.secrets.insert(
            "acme/challenges/other".to_string(),
            EncryptedBlob(codec.encrypt(b"other.example|other.keyauth").unwrap()),
        );

        web.reconcile(&state).await.unwrap();
        let challenge =
            root.join("sites/c.example/acme/.well-known/acme-challenge/tok123");
        assert_eq!(
            std::fs::read_to_string(challenge).unwrap(),
            "tok123.keyauth"
        );
        assert!(!root
            .join("sites/c.example/acme/.well-known/acme-challenge/other")
            .exists());

        // Challenge cleanup: once the secret is gone the file is too.
        let state = doc(&["c.example"]);
        web.reconcile(&state).await.unwrap();
        assert!(!root
            .join("sites/c.example/acme/.well-known/acme-challenge/tok123")
            .exists());
    }
}
