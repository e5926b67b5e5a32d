pub mod sync;

pub use sync::SyncRunner;

use crate::apps::{storage, AppFetcher};
use crate::cluster::{ChannelClient, ControllerClient};
use crate::config::AppConfig;
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::secrets::SecretCodec;
use crate::state::etcd::EtcdStateStore;
use crate::state::file::FileStateStore;
use crate::state::{NodeHealth, Site, StateMirror, StateStore};
use crate::web::{CertificateResolver, NginxControl, WebServer};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Resolves site TLS material by asking the controller.
struct ApiCertResolver {
    api: Arc<ControllerClient>,
}

#[async_trait]
impl CertificateResolver for ApiCertResolver {
    async fn resolve(&self, site: &Site) -> Result<(String, String)> {
        self.api.certificate_for_site(site).await
    }
}

/// Agent lifecycle. Subsystems are wired in dependency order (mirror →
/// fetcher → web server → sync runner → channel client); each holds
/// handles only to the ones it consults. Blocks until SIGINT/SIGTERM.
pub async fn run(config: AppConfig) -> Result<()> {
    config.validate_agent()?;
    let codec = SecretCodec::new(config.master_key()?);
    let shutdown = Arc::new(Notify::new());

    let api = Arc::new(ControllerClient::new(&config.agent)?);

    // Cluster options drive the bundle repository and manifest handling;
    // the controller may simply not be up yet, so retry.
    let options = loop {
        match api.get_cluster_options().await {
            Ok(options) => break options,
            Err(e) => {
                warn!("agent: waiting for controller: {:#}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("agent: cluster options received, repo={}", options.repo.kind);

    // The store is only used for the cluster-wide sync lock (and the
    // member heartbeat on the etcd backend).
    let store: Arc<dyn StateStore> = match config.store.backend.as_str() {
        "etcd" => {
            let etcd = Arc::new(EtcdStateStore::connect(&config.store.etcd).await?);
            start_membership(etcd.clone(), &shutdown).await?;
            etcd
        }
        _ => Arc::new(FileStateStore::new(&config.store.file_path)),
    };

    let mirror = Arc::new(StateMirror::new());
    let apps = Arc::new(AppFetcher::new(
        &config.agent.app_root,
        storage::from_repo_config(&options.repo)?,
        options.codesign_key_pem.as_deref(),
        &options.manifest_file,
        mirror.clone(),
    )?);
    let web = Arc::new(WebServer::new(
        &config.agent.app_root,
        NginxControl::new(config.agent.nginx.clone()),
        mirror.clone(),
        Arc::new(ApiCertResolver { api: api.clone() }),
        apps.clone(),
        codec,
    ));
    let notifier: Arc<dyn Notifier> = match &options.notifications {
        Some(n) if n.method == "webhook" => Arc::new(WebhookNotifier::new(n)?),
        Some(n) => {
            warn!("agent: unknown notification method {}, disabling", n.method);
            Arc::new(NoopNotifier)
        }
        None => Arc::new(NoopNotifier),
    };

    let (sync, queue_rx) = SyncRunner::new(
        store,
        mirror.clone(),
        apps.clone(),
        web.clone(),
        notifier,
    );

    // The health callback must not block: everything it reports is cached
    // by the runner and the mirror.
    let health_fn = {
        let mirror = mirror.clone();
        let sync = sync.clone();
        let node_name = config.node_name.clone();
        Arc::new(move || NodeHealth {
            node_name: node_name.clone(),
            version: sync.synced_version(),
            nginx_running: sync.nginx_running(),
            last_sync_time: sync.last_sync_time(),
            last_sync_error: sync.last_sync_error(),
            sites: mirror.all_site_health(),
        })
    };

    let (channel, handle, ready_rx) =
        ChannelClient::new(api.clone(), &config.node_name, mirror.clone(), health_fn);
    sync.set_sync_complete(Arc::new({
        let handle = handle.clone();
        move || handle.send_health()
    }));

    tokio::spawn(channel.run(shutdown.clone()));

    // Wait until the controller acknowledged our registration, then seed
    // the mirror and converge before anything is reported healthy.
    ready_rx.await.context("channel supervisor terminated")?;
    match api.get_state().await {
        // A state push may already have raced us to a newer version.
        Ok(doc) if doc.version >= mirror.version() => mirror.replace_state(doc),
        Ok(_) => {}
        Err(e) => warn!("agent: initial state fetch failed: {:#}", e),
    }
    if let Err(e) = sync.run().await {
        error!("agent: startup sync failed: {:#}", e);
    }

    // Triggers: queued runs, state pushes, SIGUSR1.
    tokio::spawn(sync.clone().run_queue_worker(queue_rx, shutdown.clone()));
    start_state_trigger(mirror.clone(), sync.clone(), &shutdown);
    start_sigusr1_trigger(sync.clone());

    crate::runtime::wait_for_termination(&shutdown).await;
    info!("agent: shutdown complete");
    Ok(())
}

fn start_state_trigger(mirror: Arc<StateMirror>, sync: Arc<SyncRunner>, shutdown: &Arc<Notify>) {
    let mut changes = mirror.subscribe();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = changes.recv() => {
                    match changed {
                        Ok(version) => {
                            info!("agent: state changed, version={}, queueing sync", version);
                            sync.queue_run();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            sync.queue_run();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

/// SIGUSR1 forces a re-sync, for operators poking a single node.
fn start_sigusr1_trigger(sync: Arc<SyncRunner>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::user_defined1(),
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("agent: cannot install SIGUSR1 handler: {}", e);
                return;
            }
        };
        while stream.recv().await.is_some() {
            info!("agent: SIGUSR1 received, queueing sync");
            sync.queue_run();
        }
    });
}

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
                warn!("agent: member keepalive failed, re-registering: {}", e);
                match etcd.register_member().await {
                    Ok(id) => lease_id = id,
                    Err(e) => error!("agent: member re-register failed: {}", e),
                }
            }
        }
    });
    Ok(())
}
