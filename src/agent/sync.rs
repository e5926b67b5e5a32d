use crate::apps::AppFetcher;
use crate::notify::Notifier;
use crate::state::{StateMirror, StateStore};
use crate::web::WebServer;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

/// How long a node waits for the cluster-wide sync lock. Rollouts can hold
/// it for a while (large app downloads), so this is generous.
const SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Pause after a proxy restart so health reporting sees the new process.
const RESTART_SETTLE: Duration = Duration::from_millis(150);

/// Callback invoked after every run, success or failure, so the agent can
/// push a fresh health report. Must not block.
pub type SyncCompleteFn = Arc<dyn Fn() + Send + Sync>;

/// The agent's serialized reconciliation pipeline.
///
/// `run` is singleflighted by an async mutex; `queue_run` coalesces
/// through a length-1 channel, so any burst of triggers while a run is in
/// progress schedules at most one successor.
pub struct SyncRunner {
    store: Arc<dyn StateStore>,
    mirror: Arc<StateMirror>,
    apps: Arc<AppFetcher>,
    web: Arc<WebServer>,
    notifier: Arc<dyn Notifier>,

    run_gate: tokio::sync::Mutex<()>,
    queue_tx: mpsc::Sender<()>,

    running: AtomicBool,
    runs_completed: AtomicU64,
    /// Highest state version this node has fully reconciled.
    synced_version: AtomicU64,
    nginx_running: AtomicBool,
    last_sync_time: Mutex<Option<i64>>,
    last_sync_error: Mutex<Option<String>>,
    sync_complete: Mutex<Option<SyncCompleteFn>>,
}

impl SyncRunner {
    pub fn new(
        store: Arc<dyn StateStore>,
        mirror: Arc<StateMirror>,
        apps: Arc<AppFetcher>,
        web: Arc<WebServer>,
        notifier: Arc<dyn Notifier>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                store,
                mirror,
                apps,
                web,
                notifier,
                run_gate: tokio::sync::Mutex::new(()),
                queue_tx,
                running: AtomicBool::new(false),
                runs_completed: AtomicU64::new(0),
                synced_version: AtomicU64::new(0),
                nginx_running: AtomicBool::new(false),
                last_sync_time: Mutex::new(None),
                last_sync_error: Mutex::new(None),
                sync_complete: Mutex::new(None),
            }),
            queue_rx,
        )
    }

    /// Wire the post-run callback (set once the channel client exists).
    pub fn set_sync_complete(&self, callback: SyncCompleteFn) {
        *self.sync_complete.lock().unwrap() = Some(callback);
    }

    /// Request a run. While one is in progress, any number of requests
    /// collapse into a single pending successor.
    pub fn queue_run(&self) {
        let _ = self.queue_tx.try_send(());
    }

    /// Drains queued run requests. Owns the trigger loop; `queue_run` only
    /// fills the gate.
    pub async fn run_queue_worker(
        self: Arc<Self>,
        mut queue_rx: mpsc::Receiver<()>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                trigger = queue_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                    if let Err(e) = self.run().await {
                        error!("sync: run failed: {:#}", e);
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Acquire)
    }

    pub fn synced_version(&self) -> u64 {
        self.synced_version.load(Ordering::Acquire)
    }

    pub fn nginx_running(&self) -> bool {
        self.nginx_running.load(Ordering::Acquire)
    }

    pub fn last_sync_time(&self) -> Option<i64> {
        *self.last_sync_time.lock().unwrap()
    }

    pub fn last_sync_error(&self) -> Option<String> {
        self.last_sync_error.lock().unwrap().clone()
    }

    /// One full reconciliation. Serialized; concurrent callers wait.
    pub async fn run(&self) -> Result<()> {
        let _gate = self.run_gate.lock().await;
        self.running.store(true, Ordering::Release);

        let result = self.run_inner().await;

        self.running.store(false, Ordering::Release);
        self.runs_completed.fetch_add(1, Ordering::AcqRel);
        *self.last_sync_error.lock().unwrap() = result.as_ref().err().map(|e| format!("{:#}", e));

        // Always report back, so the controller learns about failures too.
        let callback = self.sync_complete.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
        result
    }

    async fn run_inner(&self) -> Result<()> {
        let doc = self.mirror.snapshot();

        // The cluster-wide lock intentionally serializes convergence so a
        // rollout does not stampede ACME or the bundle repository from
        // every node at once.
        let lease = self
            .store
            .acquire_lock("sync", Some(SYNC_LOCK_TIMEOUT))
            .await?;

        *self.last_sync_time.lock().unwrap() = Some(unix_now());
        self.mirror.reset_site_health();
        info!("sync: starting, version={}", doc.version);

        let pipeline = async {
            self.apps.reconcile(&doc).await?;
            self.web.reconcile(&doc).await
        }
        .await;

        if let Err(e) = self.store.release_lock(lease).await {
            warn!("sync: releasing cluster lock failed: {:#}", e);
        }

        let restart_required = pipeline?;
        if restart_required {
            self.web.control().restart().await?;
            tokio::time::sleep(RESTART_SETTLE).await;
        }
        self.nginx_running
            .store(self.web.control().is_running().await, Ordering::Release);

        // One notification per failing site; the notifier dedups repeats
        // of the same error across syncs.
        for site in self.mirror.all_site_health() {
            if let Some(error) = site.error {
                let message = format!("site {}: {}", site.domain, error);
                if let Err(e) = self.notifier.notify(&message).await {
                    warn!("sync: notification failed: {:#}", e);
                }
            }
        }

        self.synced_version.store(doc.version, Ordering::Release);
        info!("sync: completed, version={}", doc.version);
        Ok(())
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::LocalStorage;
    use crate::config::NginxConfig;
    use crate::notify::NoopNotifier;
    use crate::secrets::SecretCodec;
    use crate::state::file::FileStateStore;
    use crate::state::{Site, StateDoc};
    use crate::web::{CertificateResolver, NginxControl};
    use async_trait::async_trait;

    struct StaticResolver;

    #[async_trait]
    impl CertificateResolver for StaticResolver {
        async fn resolve(&self, _site: &Site) -> Result<(String, String)> {
            Ok(("KEY".to_string(), "CERT".to_string()))
        }
    }

    fn runner(dir: &tempfile::TempDir) -> (Arc<SyncRunner>, mpsc::Receiver<()>, Arc<StateMirror>) {
        let root = dir.path().join("root");
        let store: Arc<dyn StateStore> =
            Arc::new(FileStateStore::new(dir.path().join("state.json")));
        let mirror = Arc::new(StateMirror::new());
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
        let web = Arc::new(WebServer::new(
            &root,
            NginxControl::new(NginxConfig {
                config_dir: dir.path().join("conf.d").to_string_lossy().to_string(),
                status_command: "true".to_string(),
                start_command: "true".to_string(),
                restart_command: "true".to_string(),
            }),
            mirror.clone(),
            Arc::new(StaticResolver),
            apps.clone(),
            SecretCodec::new([1u8; 16]),
        ));
        let (runner, queue_rx) =
            SyncRunner::new(store, mirror.clone(), apps, web, Arc::new(NoopNotifier));
        (runner, queue_rx, mirror)
    }

    fn doc(version: u64) -> StateDoc {
        StateDoc {
            version,
            sites: vec![Site {
                domain: "a.example".to_string(),
                ..Site::default()
            }],
            ..StateDoc::default()
        }
    }

    #[tokio::test]
    async fn test_run_converges_and_records_status() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _queue_rx, mirror) = runner(&dir);
        mirror.replace_state(doc(7));

        runner.run().await.unwrap();
        assert_eq!(runner.synced_version(), 7);
        assert!(runner.last_sync_time().is_some());
        assert!(runner.last_sync_error().is_none());
        assert!(runner.nginx_running());
        assert!(!runner.is_running());
        assert!(dir
            .path()
            .join("root/sites/a.example/tls/certificate.pem")
            .exists());
    }

    #[tokio::test]
    async fn test_sync_complete_fires_on_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _queue_rx, mirror) = runner(&dir);
        mirror.replace_state(doc(1));

        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        runner.set_sync_complete(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        runner.run().await.unwrap();
        runner.run().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_run_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, queue_rx, mirror) = runner(&dir);
        mirror.replace_state(doc(1));

        let shutdown = Arc::new(Notify::new());
        let worker = tokio::spawn(
            runner
                .clone()
                .run_queue_worker(queue_rx, shutdown.clone()),
        );

        for _ in 0..5 {
            runner.queue_run();
        }
        // Let the worker drain everything that was actually queued.
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.notify_waiters();
        let _ = worker.await;

        let runs = runner.runs_completed();
        assert!(
            (1..=2).contains(&runs),
            "five rapid triggers must collapse into at most two runs, got {}",
            runs
        );
    }
}
