pub mod archive;
pub mod manifest;
pub mod storage;

pub use manifest::AppManifest;
pub use storage::{LocalStorage, ObjectMetadata, ObjectStorage};

use crate::state::{StateDoc, StateMirror, DEFAULT_SITE};
use anyhow::{Context, Result};
use archive::ArchiveKind;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Fixed width of the download/extract worker pool.
const WORKERS: usize = 3;

/// Ensures every referenced app bundle is present and extracted under
/// `<root>/apps/<name>`, verified against the code-signing key, with its
/// manifest cached for the renderer.
pub struct AppFetcher {
    root: PathBuf,
    storage: Arc<dyn ObjectStorage>,
    codesign: Option<RsaPublicKey>,
    manifest_file: String,
    mirror: Arc<StateMirror>,
    manifests: Mutex<HashMap<String, AppManifest>>,
}

impl AppFetcher {
    pub fn new(
        root: impl Into<PathBuf>,
        storage: Arc<dyn ObjectStorage>,
        codesign_key_pem: Option<&str>,
        manifest_file: &str,
        mirror: Arc<StateMirror>,
    ) -> Result<Self> {
        let codesign = match codesign_key_pem {
            Some(pem) => Some(parse_public_key(pem)?),
            None => None,
        };
        Ok(Self {
            root: root.into(),
            storage,
            codesign,
            manifest_file: manifest_file.to_string(),
            mirror,
            manifests: Mutex::new(HashMap::new()),
        })
    }

    /// Manifest cached for an extracted app, if it shipped one.
    pub fn manifest_for(&self, app: &str) -> Option<AppManifest> {
        self.manifests.lock().unwrap().get(app).cloned()
    }

    /// Bring `<root>/apps` in line with the given state: fetch every
    /// referenced bundle (deduplicated, through the worker pool), record
    /// per-site errors in the mirror, then prune directories that no site
    /// references anymore.
    pub async fn reconcile(self: &Arc<Self>, doc: &StateDoc) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("apps")).await?;
        tokio::fs::create_dir_all(self.root.join("cache")).await?;

        // One job per distinct app name, regardless of how many sites use it.
        let mut seen = HashSet::new();
        let jobs: Vec<String> = doc
            .sites
            .iter()
            .filter_map(|s| s.app.clone())
            .filter(|app| seen.insert(app.clone()))
            .collect();

        let errors: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel::<String>(32);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let rx = rx.clone();
            let fetcher = self.clone();
            let errors = errors.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(name) = job else { break };
                    if let Err(e) = fetcher.fetch_app(&name).await {
                        warn!("apps: fetch failed, app={}, error={:#}", name, e);
                        errors.lock().unwrap().insert(name, format!("{:#}", e));
                    }
                }
            }));
        }

        for job in &jobs {
            // The channel is bounded; workers drain it as we fill it.
            if tx.send(job.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }

        // Attach each app's failure to every site that references it. The
        // pipeline keeps going for the healthy sites.
        let errors = Arc::try_unwrap(errors)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        for site in &doc.sites {
            if let Some(app) = &site.app {
                if let Some(error) = errors.get(app) {
                    self.mirror.set_site_health(&site.domain, Some(error.clone()));
                }
            }
        }

        self.prune(&seen).await?;
        Ok(())
    }

    async fn fetch_app(&self, name: &str) -> Result<()> {
        anyhow::ensure!(
            !name.is_empty() && !name.contains('/') && !name.contains(".."),
            "invalid app name: {}",
            name
        );

        let app_dir = self.root.join("apps").join(name);
        if tokio::fs::try_exists(&app_dir).await? {
            self.ensure_manifest_cached(name).await;
            return Ok(());
        }

        let cache_file = self.root.join("cache").join(name);
        if !tokio::fs::try_exists(&cache_file).await? {
            self.download_and_verify(name).await?;
        }

        let hint = tokio::fs::read_to_string(self.root.join("cache").join(format!(".type.{}", name)))
            .await
            .ok();
        let kind = ArchiveKind::detect(name, hint.as_deref())
            .with_context(|| format!("cannot determine archive type of {}", name))?;

        // Extract next to the final location, then rename, so a crashed
        // extraction never leaves a half-populated app directory.
        let tmp_dir = self.root.join("apps").join(format!(".tmp-{}", name));
        let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
        let extract_result = {
            let cache_file = cache_file.clone();
            let tmp_dir = tmp_dir.clone();
            tokio::task::spawn_blocking(move || archive::extract(&cache_file, kind, &tmp_dir))
                .await?
        };
        if let Err(e) = extract_result {
            let _ = tokio::fs::remove_dir_all(&tmp_dir).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp_dir, &app_dir).await?;
        info!("apps: extracted, app={}, kind={}", name, kind.extension());

        self.ensure_manifest_cached(name).await;
        Ok(())
    }

    /// Download the archive into the cache, hashing the stream as it lands
    /// on disk and verifying hash and signature metadata before the file
    /// is made visible under its final name.
    async fn download_and_verify(&self, name: &str) -> Result<()> {
        let (mut stream, metadata) = self.storage.get(name).await?;

        let tmp = self.root.join("cache").join(format!(".tmp-{}", name));
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);
        let digest = hasher.finalize();

        if let Some(expected) = &metadata.hash {
            let actual: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                let _ = tokio::fs::remove_file(&tmp).await;
                anyhow::bail!("hash mismatch for {}", name);
            }
        }

        match (&metadata.signature, &self.codesign) {
            (Some(signature), Some(key)) => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(signature.trim())
                    .context("decoding bundle signature")?;
                if key
                    .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &raw)
                    .is_err()
                {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    anyhow::bail!("signature mismatch for {}", name);
                }
            }
            (Some(_), None) => {
                warn!("apps: bundle {} is signed but no code-signing key is configured", name);
            }
            (None, Some(_)) => {
                warn!("apps: bundle {} has no signature to verify", name);
            }
            (None, None) => {}
        }

        // Remember the archive type so re-extraction works even when the
        // name carries no extension.
        let extension = metadata
            .extension
            .as_deref()
            .and_then(|ext| ArchiveKind::detect("", Some(ext)))
            .or_else(|| ArchiveKind::detect(name, None));
        if let Some(kind) = extension {
            tokio::fs::write(
                self.root.join("cache").join(format!(".type.{}", name)),
                kind.extension(),
            )
            .await?;
        }

        tokio::fs::rename(&tmp, self.root.join("cache").join(name)).await?;
        info!("apps: downloaded, app={}", name);
        Ok(())
    }

    async fn ensure_manifest_cached(&self, name: &str) {
        if self.manifests.lock().unwrap().contains_key(name) {
            return;
        }
        let path = self.root.join("apps").join(name).join(&self.manifest_file);
        if !path.exists() {
            return;
        }
        let loaded = tokio::task::spawn_blocking(move || AppManifest::load(&path)).await;
        match loaded {
            Ok(Ok(manifest)) => {
                self.manifests
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), manifest);
            }
            Ok(Err(e)) => warn!("apps: manifest ignored, app={}, error={:#}", name, e),
            Err(e) => warn!("apps: manifest load panicked, app={}: {}", name, e),
        }
    }

    /// Remove anything under `<root>/apps` that is neither an expected app
    /// nor the built-in default site content.
    async fn prune(&self, keep: &HashSet<String>) -> Result<()> {
        let apps_dir = self.root.join("apps");
        let mut entries = tokio::fs::read_dir(&apps_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == DEFAULT_SITE || keep.contains(&name) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
            self.manifests.lock().unwrap().remove(&name);
            info!("apps: pruned, name={}", name);
        }
        Ok(())
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .context("parsing code-signing public key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Site;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;
    use std::fs::File;
    use std::io::Write;

    fn write_targz(path: &std::path::Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn doc_with_app(app: &str) -> StateDoc {
        StateDoc {
            version: 1,
            sites: vec![Site {
                domain: "a.example".to_string(),
                app: Some(app.to_string()),
                ..Site::default()
            }],
            ..StateDoc::default()
        }
    }

    fn fetcher(
        root: &std::path::Path,
        repo: &std::path::Path,
        codesign: Option<&str>,
    ) -> (Arc<AppFetcher>, Arc<StateMirror>) {
        let mirror = Arc::new(StateMirror::new());
        let fetcher = AppFetcher::new(
            root,
            Arc::new(LocalStorage::new(repo)),
            codesign,
            "statiko.yaml",
            mirror.clone(),
        )
        .unwrap();
        (Arc::new(fetcher), mirror)
    }

    #[tokio::test]
    async fn test_fetch_extract_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&repo).unwrap();
        write_targz(&repo.join("site.tar.gz"), &[("wrap/index.html", "<html>")]);

        let (fetcher, _mirror) = fetcher(&root, &repo, None);

        // A leftover directory from a removed app gets pruned.
        std::fs::create_dir_all(root.join("apps/stale-app")).unwrap();
        std::fs::create_dir_all(root.join("apps/_default")).unwrap();

        let doc = doc_with_app("site.tar.gz");
        fetcher.reconcile(&doc).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(root.join("apps/site.tar.gz/index.html")).unwrap(),
            "<html>"
        );
        assert!(root.join("cache/site.tar.gz").exists());
        assert!(!root.join("apps/stale-app").exists());
        assert!(root.join("apps/_default").exists());

        // Idempotent: a second pass touches nothing and still succeeds.
        fetcher.reconcile(&doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_manifest_cached_after_extract() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&repo).unwrap();
        write_targz(
            &repo.join("docs.tar.gz"),
            &[
                ("index.html", "<html>"),
                ("statiko.yaml", "rules:\n  - exact: /x\n    client_caching: max\n"),
            ],
        );

        let (fetcher, _mirror) = fetcher(&root, &repo, None);
        fetcher.reconcile(&doc_with_app("docs.tar.gz")).await.unwrap();

        let manifest = fetcher.manifest_for("docs.tar.gz").unwrap();
        assert_eq!(manifest.rules.len(), 1);
        assert!(fetcher.manifest_for("absent").is_none());
    }

    #[tokio::test]
    async fn test_bad_signature_deletes_cache_and_marks_site() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&repo).unwrap();
        write_targz(&repo.join("signed.tar.gz"), &[("index.html", "<html>")]);

        // Metadata carries a signature that cannot verify.
        let mut meta = File::create(repo.join("signed.tar.gz.meta")).unwrap();
        write!(
            meta,
            r#"{{"signature": "{}"}}"#,
            base64::engine::general_purpose::STANDARD.encode([0u8; 256])
        )
        .unwrap();

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let public_pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let (fetcher, mirror) = fetcher(&root, &repo, Some(&public_pem));
        let doc = doc_with_app("signed.tar.gz");
        mirror.replace_state(doc.clone());
        mirror.reset_site_health();

        fetcher.reconcile(&doc).await.unwrap();

        let error = mirror.get_site_health("a.example").unwrap();
        assert!(error.contains("signature mismatch"), "got: {}", error);
        assert!(!root.join("cache/signed.tar.gz").exists());
        assert!(!root.join("apps/signed.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_valid_signature_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&repo).unwrap();
        write_targz(&repo.join("signed.tar.gz"), &[("index.html", "<html>")]);

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let archive_bytes = std::fs::read(repo.join("signed.tar.gz")).unwrap();
        let digest = Sha256::digest(&archive_bytes);
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        std::fs::write(
            repo.join("signed.tar.gz.meta"),
            format!(
                r#"{{"signature": "{}"}}"#,
                base64::engine::general_purpose::STANDARD.encode(signature)
            ),
        )
        .unwrap();

        let public_pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let (fetcher, _mirror) = fetcher(&root, &repo, Some(&public_pem));
        fetcher.reconcile(&doc_with_app("signed.tar.gz")).await.unwrap();
        assert!(root.join("apps/signed.tar.gz/index.html").exists());
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let root = dir.path().join("root");
        std::fs::create_dir_all(&repo).unwrap();
        write_targz(&repo.join("app.tar.gz"), &[("index.html", "x")]);
        std::fs::write(
            repo.join("app.tar.gz.meta"),
            r#"{"hash": "deadbeef"}"#,
        )
        .unwrap();

        let (fetcher, mirror) = fetcher(&root, &repo, None);
        let doc = doc_with_app("app.tar.gz");
        mirror.replace_state(doc.clone());
        mirror.reset_site_health();
        fetcher.reconcile(&doc).await.unwrap();

        assert!(mirror
            .get_site_health("a.example")
            .unwrap()
            .contains("hash mismatch"));
        assert!(!root.join("cache/app.tar.gz").exists());
    }
}
