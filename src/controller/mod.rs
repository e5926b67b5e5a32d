use crate::certs::{AcmeClient, AcmeWorker, CertSource, VaultClient};
use crate::cluster::server::build_tls_acceptor;
use crate::cluster::{ChannelServer, NodeRegistry};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::secrets::SecretCodec;
use crate::state::etcd::EtcdStateStore;
use crate::state::file::FileStateStore;
use crate::state::{StateManager, StateStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// External collaborators the embedding binary may wire in.
#[derive(Default)]
pub struct Collaborators {
    pub acme: Option<Arc<dyn AcmeClient>>,
    pub vault: Option<Arc<dyn VaultClient>>,
}

/// Controller lifecycle: store → state manager → registry → certificate
/// source → channel server, with the etcd membership/watch loops when the
/// cluster backend is selected. Blocks until SIGINT/SIGTERM.
pub async fn run(config: AppConfig, collaborators: Collaborators) -> Result<()> {
    config.validate_controller()?;
    let _ = rustls::crypto::ring::default_provider().install_default();
    let metrics = Metrics::install();

    let codec = SecretCodec::new(config.master_key()?);
    let shutdown = Arc::new(Notify::new());

    // Phase 1: the store, plus the cluster-backend side loops.
    let (store, etcd): (Arc<dyn StateStore>, Option<Arc<EtcdStateStore>>) =
        match config.store.backend.as_str() {
            "etcd" => {
                let etcd = Arc::new(EtcdStateStore::connect(&config.store.etcd).await?);
                (etcd.clone(), Some(etcd))
            }
            _ => (
                Arc::new(FileStateStore::new(&config.store.file_path)),
                None,
            ),
        };

    // Phase 2: authoritative state.
    let manager = StateManager::load(store.clone(), codec).await?;
    info!(
        "controller: state ready, version={}, backend={}",
        manager.version(),
        config.store.backend
    );

    // Phase 3: registry, certificates, ACME jobs.
    let registry = Arc::new(NodeRegistry::new(None));
    let (acme_worker, acme_jobs) = AcmeWorker::new(
        manager.clone(),
        registry.clone(),
        collaborators.acme,
        config.controller.acme.clone(),
    );
    if !config.controller.acme.email.is_empty() && !acme_worker.enabled() {
        warn!("controller: ACME email configured but no ACME client wired");
    }
    let certs = Arc::new(CertSource::new(
        manager.clone(),
        acme_worker.clone(),
        collaborators.vault,
    ));

    tokio::spawn(acme_worker.clone().run(acme_jobs, shutdown.clone()));
    tokio::spawn(acme_worker.clone().run_renewal(shutdown.clone()));

    // Phase 4: cluster-backend loops (membership heartbeat, external watch).
    if let Some(etcd) = &etcd {
        start_membership(etcd.clone(), &shutdown).await?;
        start_external_watch(etcd.clone(), manager.clone(), &shutdown);
    }

    // Phase 5: the channel server.
    let server = Arc::new(ChannelServer::new(
        manager.clone(),
        registry.clone(),
        certs,
        config.cluster.clone(),
        &config.controller,
        metrics,
    ));
    let acceptor = build_tls_acceptor(&config.controller)?;
    let listen = config.controller.listen.clone();
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.run(&listen, acceptor, shutdown).await }
    });

    crate::runtime::wait_for_termination(&shutdown).await;

    if let Err(e) = server_handle.await {
        error!("controller: server task error: {}", e);
    }
    info!("controller: shutdown complete");
    Ok(())
}

/// Register this member under its short-TTL lease and keep it alive; the
/// key expiring is how other members notice we are gone.
async fn start_membership(etcd: Arc<EtcdStateStore>, shutdown: &Arc<Notify>) -> Result<()> {
    let mut lease_id = etcd.register_member().await?;
    let interval = etcd.member_keepalive_interval();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.notified() => {
                    etcd.unregister_member(lease_id).await;
                    return;
                }
            }
            if let Err(e) = etcd.member_keepalive(lease_id).await {
                warn!("controller: member keepalive failed, re-registering: {}", e);
                match etcd.register_member().await {
                    Ok(id) => lease_id = id,
                    Err(e) => error!("controller: member re-register failed: {}", e),
                }
            }
        }
    });
    Ok(())
}

/// Watch the store for writes made by other controllers and reload; the
/// reload notifies local subscribers, which pushes to every agent stream.
fn start_external_watch(
    etcd: Arc<EtcdStateStore>,
    manager: Arc<StateManager>,
    shutdown: &Arc<Notify>,
) {
    {
        let mut changes = etcd.subscribe_external_change();
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.recv() => {
                        if changed.is_err() {
                            return;
                        }
                        if let Err(e) = manager.reload_from_store().await {
                            error!("controller: reload after external change failed: {:#}", e);
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = etcd.watch_once() => {
                    warn!("controller: store watch ended, reconnecting...");
                }
                _ = shutdown.notified() => return,
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    });
}
