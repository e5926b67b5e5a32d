//! Controller ↔ agent channel over a loopback TLS listener: registration,
//! state push, health round-trip, the version barrier, and the unary RPCs.

use statiko::certs::{AcmeWorker, CertSource};
use statiko::cluster::client::HealthFn;
use statiko::cluster::server::build_tls_acceptor;
use statiko::cluster::{ChannelClient, ChannelServer, ControllerClient, NodeRegistry};
use statiko::config::{AgentConfig, ClusterOptionsConfig, ControllerConfig};
use statiko::secrets::SecretCodec;
use statiko::state::file::FileStateStore;
use statiko::state::{NodeHealth, Site, StateManager, StateMirror};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

const TOKEN: &str = "loopback-test-token";

fn agent_config(port: u16, token: &str) -> AgentConfig {
    AgentConfig {
        controller_address: format!("https://127.0.0.1:{}", port),
        auth_token: token.to_string(),
        tls_skip_verify: true,
        ..AgentConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_end_to_end() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let metrics = statiko::metrics::Metrics::install();
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(Notify::new());

    // Controller side.
    let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
    let manager = StateManager::load(store, SecretCodec::new([3u8; 16]))
        .await
        .unwrap();
    let registry = Arc::new(NodeRegistry::new(None));
    let (acme_worker, _jobs) = AcmeWorker::new(
        manager.clone(),
        registry.clone(),
        None,
        Default::default(),
    );
    let certs = Arc::new(CertSource::new(manager.clone(), acme_worker, None));

    let controller_cfg = ControllerConfig {
        auth_token: TOKEN.to_string(),
        ..ControllerConfig::default()
    };
    let server = Arc::new(ChannelServer::new(
        manager.clone(),
        registry.clone(),
        certs,
        ClusterOptionsConfig::default(),
        &controller_cfg,
        metrics,
    ));

    let acceptor = build_tls_acceptor(&controller_cfg).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(server.run_on(listener, acceptor, shutdown.clone()));

    // Agent side: supervisor with an instrumented health callback.
    let api = Arc::new(ControllerClient::new(&agent_config(port, TOKEN)).unwrap());
    let mirror = Arc::new(StateMirror::new());
    let reported_version = Arc::new(AtomicU64::new(0));
    let health_fn: HealthFn = {
        let reported_version = reported_version.clone();
        Arc::new(move || NodeHealth {
            node_name: "edge-1".to_string(),
            version: reported_version.load(Ordering::Acquire),
            nginx_running: true,
            ..NodeHealth::default()
        })
    };
    let (channel, handle, ready_rx) =
        ChannelClient::new(api.clone(), "edge-1", mirror.clone(), health_fn);
    tokio::spawn(channel.run(shutdown.clone()));

    timeout(Duration::from_secs(15), ready_rx)
        .await
        .expect("registration timed out")
        .expect("supervisor died");

    // Unary RPCs work once registered.
    let doc = api.get_state().await.unwrap();
    assert_eq!(doc.version, 0);
    let options = api.get_cluster_options().await.unwrap();
    assert_eq!(options.manifest_file, "statiko.yaml");

    // A wrong bearer token is rejected.
    let bad_api = ControllerClient::new(&agent_config(port, "wrong")).unwrap();
    assert!(bad_api.get_state().await.is_err());

    // A state mutation is pushed to the connected agent.
    let mut mirror_rx = mirror.subscribe();
    manager
        .add_site(Site {
            domain: "a.example".to_string(),
            aliases: vec!["b.example".to_string()],
            ..Site::default()
        })
        .await
        .unwrap();
    let pushed = timeout(Duration::from_secs(10), mirror_rx.recv())
        .await
        .expect("state push timed out")
        .unwrap();
    assert_eq!(pushed, 1);
    assert_eq!(mirror.get_site("b.example").unwrap().domain, "a.example");

    // The agent reports back a reconciled version; the barrier falls.
    reported_version.store(1, Ordering::Release);
    handle.send_health();
    timeout(Duration::from_secs(10), registry.wait_for_version(1))
        .await
        .expect("version barrier timed out")
        .unwrap();

    // A cluster health round expires the ping through the live stream.
    let health = registry
        .request_cluster_health(Some(Duration::from_secs(10)))
        .await;
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].node_name, "edge-1");
    assert_eq!(health[0].version, 1);
    assert!(health[0].nginx_running);

    // The ACME challenge endpoint is public and domain-scoped.
    manager
        .set_secret("acme/challenges/tok1", b"a.example|tok1.keyauth")
        .await
        .unwrap();
    assert_eq!(
        api.get_acme_challenge_response("tok1", "a.example")
            .await
            .unwrap()
            .as_deref(),
        Some("tok1.keyauth")
    );
    assert!(api
        .get_acme_challenge_response("tok1", "evil.example")
        .await
        .unwrap()
        .is_none());

    shutdown.notify_waiters();
}
