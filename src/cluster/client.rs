use crate::cluster::{CertificateRequest, CertificateResponse, ChallengeResponse};
use crate::config::{AgentConfig, ClusterOptionsConfig};
use crate::state::{ClientFrame, NodeHealth, ServerFrame, Site, SiteTls, StateDoc, StateMirror};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

/// Deadline for every unary controller RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// TCP keepalive on the long-lived channel connection.
const KEEPALIVE: Duration = Duration::from_secs(600);

/// Pause after the controller rejects a registration, so an auth or name
/// conflict does not turn into a hot reconnect loop.
const REJECTED_BACKOFF: Duration = Duration::from_secs(5);

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// HTTP client for the controller: unary RPCs plus the streaming channel.
/// TLS is mandatory; a custom CA bundle or (development only) disabled
/// verification are supported for self-signed controllers.
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl ControllerClient {
    pub fn new(cfg: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .tcp_keepalive(Some(KEEPALIVE))
            .connect_timeout(Duration::from_secs(15));

        if let Some(ca_file) = &cfg.tls_ca_file {
            let pem = std::fs::read(ca_file)
                .with_context(|| format!("reading CA bundle {}", ca_file))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem).context("parsing CA bundle")?,
            );
        }
        if cfg.tls_skip_verify {
            warn!("client: TLS verification disabled; never do this in production");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.controller_address.trim_end_matches('/').to_string(),
            auth_token: cfg.auth_token.clone(),
        })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.auth_token)
            .timeout(RPC_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("calling {}", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} failed: {} - {}", path, status, text);
        }
        Ok(resp.json().await?)
    }

    pub async fn get_state(&self) -> Result<StateDoc> {
        self.rpc("/rpc/state", &serde_json::json!({})).await
    }

    pub async fn get_cluster_options(&self) -> Result<ClusterOptionsConfig> {
        self.rpc("/rpc/cluster-options", &serde_json::json!({})).await
    }

    pub async fn get_certificate(&self, request: &CertificateRequest) -> Result<(String, String)> {
        let resp: CertificateResponse = self.rpc("/rpc/certificate", request).await?;
        Ok((resp.key_pem, resp.cert_pem))
    }

    /// Resolve the TLS material for one site, whatever its selector.
    pub async fn certificate_for_site(&self, site: &Site) -> Result<(String, String)> {
        let request = match &site.tls {
            Some(SiteTls::Vault { name, version }) => CertificateRequest {
                vault_name: Some(name.clone()),
                vault_version: version.clone(),
                ..CertificateRequest::default()
            },
            _ => {
                let id = site.certificate_id().with_context(|| {
                    format!("site {} has no certificate reference", site.domain)
                })?;
                CertificateRequest {
                    certificate_id: Some(id.to_string()),
                    ..CertificateRequest::default()
                }
            }
        };
        self.get_certificate(&request).await
    }

    /// Resolve a pending ACME challenge (public endpoint, used by tests
    /// and tooling; the in-band path is the agent's materialized files).
    pub async fn get_acme_challenge_response(
        &self,
        token: &str,
        domain: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .http
            .post(format!("{}/rpc/acme-challenge", self.base_url))
            .timeout(RPC_TIMEOUT)
            .json(&serde_json::json!({ "token": token, "domain": domain }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        anyhow::ensure!(resp.status().is_success(), "challenge lookup failed");
        let parsed: ChallengeResponse = resp.json().await?;
        Ok(Some(parsed.response))
    }

    /// Open the bidirectional channel: the returned sender feeds client
    /// frames into the streaming request body, the stream yields server
    /// frames from the response body.
    pub async fn open_channel(&self) -> Result<(FrameSender, FrameStream)> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));

        let resp = self
            .http
            .post(format!("{}/channel", self.base_url))
            .bearer_auth(&self.auth_token)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("opening channel")?;

        if !resp.status().is_success() {
            anyhow::bail!("channel rejected: {}", resp.status());
        }

        Ok((
            FrameSender { tx },
            FrameStream {
                stream: Box::pin(resp.bytes_stream()),
                buf: BytesMut::with_capacity(4096),
            },
        ))
    }
}

/// Write half of the channel. Dropping it closes the request body, which
/// the controller sees as the stream ending.
pub struct FrameSender {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl FrameSender {
    pub async fn send(&self, frame: &ClientFrame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.tx
            .send(Ok(Bytes::from(line)))
            .await
            .map_err(|_| anyhow::anyhow!("channel send side closed"))
    }
}

/// Read half of the channel: newline-delimited JSON server frames.
pub struct FrameStream {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl FrameStream {
    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ServerFrame>(&line) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        error!("client: unparseable server frame: {}, line={}", e, line);
                        continue;
                    }
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!("client: channel stream error: {}", e);
                    return None;
                }
                None => return None,
            }
        }
    }
}

/// Builds the node's current health report. Must not block: it runs on the
/// channel task between frames.
pub type HealthFn = Arc<dyn Fn() -> NodeHealth + Send + Sync>;

/// Handle other subsystems use to make the supervisor send a fresh health
/// report (the sync-complete callback).
#[derive(Clone)]
pub struct ChannelHandle {
    health_trigger: mpsc::Sender<()>,
}

impl ChannelHandle {
    pub fn send_health(&self) {
        // Coalescing is fine: one pending trigger is enough.
        let _ = self.health_trigger.try_send(());
    }
}

/// The agent's single long-lived channel supervisor: connect with retry,
/// register, then multiplex state pushes, health pings and local health
/// triggers until the stream or the process dies.
pub struct ChannelClient {
    api: Arc<ControllerClient>,
    node_name: String,
    mirror: Arc<StateMirror>,
    health_fn: HealthFn,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    health_rx: mpsc::Receiver<()>,
}

impl ChannelClient {
    pub fn new(
        api: Arc<ControllerClient>,
        node_name: &str,
        mirror: Arc<StateMirror>,
        health_fn: HealthFn,
    ) -> (Self, ChannelHandle, oneshot::Receiver<()>) {
        let (health_tx, health_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        (
            Self {
                api,
                node_name: node_name.to_string(),
                mirror,
                health_fn,
                ready_tx: Mutex::new(Some(ready_tx)),
                health_rx,
            },
            ChannelHandle {
                health_trigger: health_tx,
            },
            ready_rx,
        )
    }

    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let mut backoff = Duration::from_secs(1);

        loop {
            let connect = tokio::select! {
                result = self.api.open_channel() => result,
                _ = shutdown.notified() => return,
            };

            let (sender, mut frames) = match connect {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("client: controller unreachable: {:#}", e);
                    if sleep_or_shutdown(backoff, &shutdown).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if sender
                .send(&ClientFrame::RegisterNode {
                    node_name: self.node_name.clone(),
                })
                .await
                .is_err()
            {
                continue;
            }

            match frames.next_frame().await {
                Some(ServerFrame::Ok) => {
                    info!("client: registered, node={}", self.node_name);
                    backoff = Duration::from_secs(1);
                    if let Some(ready) = self.ready_tx.lock().unwrap().take() {
                        let _ = ready.send(());
                    }
                }
                Some(ServerFrame::Error { message }) => {
                    error!("client: registration rejected: {}", message);
                    if sleep_or_shutdown(REJECTED_BACKOFF, &shutdown).await {
                        return;
                    }
                    continue;
                }
                other => {
                    warn!("client: unexpected first frame: {:?}", other.map(frame_name));
                    if sleep_or_shutdown(backoff, &shutdown).await {
                        return;
                    }
                    continue;
                }
            }

            // Registered: multiplex until the stream breaks.
            loop {
                tokio::select! {
                    frame = frames.next_frame() => {
                        match frame {
                            Some(ServerFrame::State(doc)) => {
                                info!("client: state received, version={}", doc.version);
                                self.mirror.replace_state(doc);
                            }
                            Some(ServerFrame::HealthPing) => {
                                let health = (self.health_fn)();
                                if sender.send(&ClientFrame::Health(health)).await.is_err() {
                                    break;
                                }
                            }
                            Some(ServerFrame::Ok) | Some(ServerFrame::Error { .. }) => {}
                            None => {
                                warn!("client: channel stream ended, reconnecting");
                                break;
                            }
                        }
                    }

                    trigger = self.health_rx.recv() => {
                        if trigger.is_none() {
                            return;
                        }
                        let health = (self.health_fn)();
                        if sender.send(&ClientFrame::Health(health)).await.is_err() {
                            break;
                        }
                    }

                    _ = shutdown.notified() => return,
                }
            }
            // `sender` drops here, closing our side before reconnecting.
        }
    }
}

fn frame_name(frame: ServerFrame) -> &'static str {
    match frame {
        ServerFrame::Ok => "ok",
        ServerFrame::Error { .. } => "error",
        ServerFrame::State(_) => "state",
        ServerFrame::HealthPing => "health_ping",
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}
