use crate::certs::{acme, CertSource};
use crate::cluster::registry::NodeRegistry;
use crate::cluster::{CertificateRequest, CertificateResponse, ChallengeRequest, ChallengeResponse};
use crate::config::{ClusterOptionsConfig, ControllerConfig};
use crate::error::StatikoError;
use crate::state::{ClientFrame, NodeHealth, ServerFrame, StateManager};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serde_json::to_vec(body).unwrap_or_default()))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// The controller's TLS listener: the per-node bidirectional channel plus
/// the unary RPCs agents use at startup, and a small ops surface
/// (`/healthz`, `/metrics`, `/nodes`).
///
/// Every endpoint except the ACME challenge response requires the shared
/// bearer token; the challenge endpoint must stay public because the CA
/// fetches it through an arbitrary node.
pub struct ChannelServer {
    manager: Arc<StateManager>,
    registry: Arc<NodeRegistry>,
    certs: Arc<CertSource>,
    options: ClusterOptionsConfig,
    auth_token: String,
    metrics: crate::metrics::Metrics,
}

impl ChannelServer {
    pub fn new(
        manager: Arc<StateManager>,
        registry: Arc<NodeRegistry>,
        certs: Arc<CertSource>,
        options: ClusterOptionsConfig,
        controller: &ControllerConfig,
        metrics: crate::metrics::Metrics,
    ) -> Self {
        Self {
            manager,
            registry,
            certs,
            options,
            auth_token: controller.auth_token.clone(),
            metrics,
        }
    }

    /// Bind and serve. Runs until `shutdown` is notified.
    pub async fn run(
        self: Arc<Self>,
        listen: &str,
        acceptor: TlsAcceptor,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding {}", listen))?;
        self.run_on(listener, acceptor, shutdown).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn run_on(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        info!(
            "server: channel listening, addr={}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    info!("server: channel listener stopping");
                    return Ok(());
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("server: accept failed, error={}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("server: TLS handshake failed, peer={}, error={}", peer_addr, e);
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    let shutdown = shutdown.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, shutdown).await) }
                });

                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, svc)
                    .await
                {
                    let msg = e.to_string();
                    if !msg.contains("connection closed") && !msg.contains("connection reset") {
                        warn!("server: connection error, peer={}, error={}", peer_addr, msg);
                    }
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>, shutdown: Arc<Notify>) -> Response<BoxBody> {
        let path = req.uri().path().to_string();

        // Public surface first.
        match path.as_str() {
            "/healthz" => {
                let healthy = self.manager.store().healthy().await;
                let status = if healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                return json_response(
                    status,
                    &serde_json::json!({ "status": if healthy { "ok" } else { "degraded" } }),
                );
            }
            "/metrics" => {
                return Response::builder()
                    .status(200)
                    .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(full_body(self.metrics.render()))
                    .unwrap();
            }
            "/rpc/acme-challenge" => return self.handle_acme_challenge(req).await,
            _ => {}
        }

        if !self.authorized(&req) {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        match path.as_str() {
            "/channel" => self.handle_channel(req, shutdown),
            "/rpc/state" => json_response(StatusCode::OK, &*self.manager.snapshot()),
            "/rpc/cluster-options" => json_response(StatusCode::OK, &self.options),
            "/rpc/certificate" => self.handle_certificate(req).await,
            "/nodes" => {
                let health = self.registry.request_cluster_health(None).await;
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "cluster_min_version": self.registry.cluster_min_version(),
                        "nodes": health,
                    }),
                )
            }
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn authorized(&self, req: &Request<Incoming>) -> bool {
        let Some(value) = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(token) = value.strip_prefix("Bearer ") else {
            return false;
        };
        !self.auth_token.is_empty()
            && constant_time_eq(token.as_bytes(), self.auth_token.as_bytes())
    }

    async fn handle_certificate(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let Ok(body) = req.into_body().collect().await else {
            return error_response(StatusCode::BAD_REQUEST, "unreadable body");
        };
        let Ok(request) = serde_json::from_slice::<CertificateRequest>(&body.to_bytes()) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid request");
        };

        let result = match (&request.certificate_id, &request.vault_name) {
            (Some(id), _) if !id.is_empty() => self.certs.get_certificate(id).await,
            (_, Some(name)) if !name.is_empty() => {
                self.certs
                    .get_vault_certificate(name, request.vault_version.as_deref())
                    .await
            }
            _ => return error_response(StatusCode::BAD_REQUEST, "missing certificate selector"),
        };

        match result {
            Ok((key_pem, cert_pem)) => {
                json_response(StatusCode::OK, &CertificateResponse { key_pem, cert_pem })
            }
            Err(e) if matches!(e.downcast_ref::<StatikoError>(), Some(StatikoError::NotFound)) => {
                error_response(StatusCode::NOT_FOUND, "certificate not found")
            }
            Err(e) => {
                error!("server: certificate resolution failed: {:#}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "certificate error")
            }
        }
    }

    async fn handle_acme_challenge(&self, req: Request<Incoming>) -> Response<BoxBody> {
        // Accept both a JSON body and query parameters; the validating CA
        // path goes through the agents, tooling sometimes probes directly.
        let query: Option<ChallengeRequest> = req.uri().query().and_then(|q| {
            let mut token = None;
            let mut domain = None;
            for pair in q.split('&') {
                match pair.split_once('=') {
                    Some(("token", v)) => token = Some(v.to_string()),
                    Some(("domain", v)) => domain = Some(v.to_string()),
                    _ => {}
                }
            }
            Some(ChallengeRequest {
                token: token?,
                domain: domain?,
            })
        });

        let request = match query {
            Some(r) => r,
            None => {
                let Ok(body) = req.into_body().collect().await else {
                    return error_response(StatusCode::BAD_REQUEST, "unreadable body");
                };
                match serde_json::from_slice::<ChallengeRequest>(&body.to_bytes()) {
                    Ok(r) => r,
                    Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid request"),
                }
            }
        };

        match acme::challenge_response(&self.manager, &request.token, &request.domain) {
            Ok(Some(response)) => {
                json_response(StatusCode::OK, &ChallengeResponse { response })
            }
            Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown challenge"),
            Err(e) => {
                error!("server: challenge lookup failed: {:#}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "challenge error")
            }
        }
    }

    /// Upgrade the request into the bidirectional NDJSON channel: client
    /// frames arrive on the request body, server frames leave on the
    /// streamed response body.
    fn handle_channel(&self, req: Request<Incoming>, shutdown: Arc<Notify>) -> Response<BoxBody> {
        let (frame_tx, frame_rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(64);

        let loop_ctx = ConnectionContext {
            manager: self.manager.clone(),
            registry: self.registry.clone(),
        };
        tokio::spawn(async move {
            connection_loop(loop_ctx, req.into_body(), frame_tx, shutdown).await;
        });

        let body = StreamBody::new(ReceiverStream::new(frame_rx));
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/x-ndjson")
            .body(BodyExt::boxed(body))
            .unwrap()
    }
}

struct ConnectionContext {
    manager: Arc<StateManager>,
    registry: Arc<NodeRegistry>,
}

/// One connected agent's event loop: register, then multiplex incoming
/// frames, registry health requests, local state-change notifications and
/// shutdown. Unregisters on every exit path.
async fn connection_loop(
    ctx: ConnectionContext,
    body: Incoming,
    out: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
    shutdown: Arc<Notify>,
) {
    let mut reader = FrameReader::new(body);

    // The first frame must be the registration.
    let node_name = match reader.next_frame().await {
        Some(ClientFrame::RegisterNode { node_name }) if !node_name.is_empty() => node_name,
        Some(_) | None => {
            let _ = send_frame(
                &out,
                &ServerFrame::Error {
                    message: "first frame must register a node name".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let (health_tx, mut health_rx) = mpsc::unbounded_channel::<oneshot::Sender<NodeHealth>>();
    if let Err(e) = ctx.registry.register(&node_name, health_tx) {
        let _ = send_frame(
            &out,
            &ServerFrame::Error {
                message: format!("{:#}", e),
            },
        )
        .await;
        return;
    }
    if send_frame(&out, &ServerFrame::Ok).await.is_err() {
        ctx.registry.unregister(&node_name);
        return;
    }
    info!("server: channel established, node={}", node_name);

    let mut state_rx = ctx.manager.subscribe();
    let mut last_pushed: u64 = 0;
    // Health response slots queued since the last incoming health report.
    let mut pending_health: Vec<oneshot::Sender<NodeHealth>> = Vec::new();

    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                match frame {
                    Some(ClientFrame::Health(health)) => {
                        ctx.registry.received_version(&node_name, health.version);
                        // Deliver to whoever asked since the last report,
                        // then forget the slots: unsolicited reports are
                        // not cached.
                        for slot in pending_health.drain(..) {
                            let _ = slot.send(health.clone());
                        }
                    }
                    Some(other) => {
                        warn!(
                            "server: unexpected frame from {}, type={:?}",
                            node_name,
                            std::mem::discriminant(&other)
                        );
                    }
                    None => break,
                }
            }

            slot = health_rx.recv() => {
                let Some(slot) = slot else { break };
                pending_health.push(slot);
                if send_frame(&out, &ServerFrame::HealthPing).await.is_err() {
                    break;
                }
            }

            changed = state_rx.recv() => {
                match changed {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Coalesced pushes are fine: each stream sees a
                        // strictly increasing subsequence of versions.
                        let doc = ctx.manager.snapshot();
                        if doc.version > last_pushed {
                            last_pushed = doc.version;
                            metrics::counter!("statiko_state_pushes_total").increment(1);
                            if send_frame(&out, &ServerFrame::State((*doc).clone())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = shutdown.notified() => break,
        }
    }

    ctx.registry.unregister(&node_name);
    info!("server: channel closed, node={}", node_name);
}

async fn send_frame(
    out: &mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
    frame: &ServerFrame,
) -> Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    out.send(Ok(Frame::data(Bytes::from(line))))
        .await
        .map_err(|_| anyhow::anyhow!("channel response closed"))
}

/// Newline-delimited JSON reader over a hyper request body.
struct FrameReader {
    body: Incoming,
    buf: BytesMut,
    done: bool,
}

impl FrameReader {
    fn new(body: Incoming) -> Self {
        Self {
            body,
            buf: BytesMut::with_capacity(4096),
            done: false,
        }
    }

    async fn next_frame(&mut self) -> Option<ClientFrame> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientFrame>(&line) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        warn!("server: unparseable client frame: {}, line={}", e, line);
                        continue;
                    }
                }
            }

            if self.done {
                return None;
            }
            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        self.buf.extend_from_slice(data);
                    }
                }
                Some(Err(e)) => {
                    warn!("server: channel body error: {}", e);
                    self.done = true;
                }
                None => self.done = true,
            }
        }
    }
}

/// Byte-equality without early exit, for the shared bearer secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Build the TLS acceptor from configured PEM files, or generate a
/// throwaway self-signed pair when none are configured (development only).
pub fn build_tls_acceptor(controller: &ControllerConfig) -> Result<TlsAcceptor> {
    let (cert_chain, key) = match (&controller.tls_cert_file, &controller.tls_key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
                std::fs::File::open(cert_file).context("opening TLS certificate")?,
            ))
            .collect::<Result<Vec<_>, _>>()
            .context("parsing TLS certificate")?;
            let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
                std::fs::File::open(key_file).context("opening TLS key")?,
            ))
            .context("parsing TLS key")?
            .context("no private key found")?;
            (certs, key)
        }
        _ => {
            warn!("server: no TLS files configured, generating a throwaway certificate");
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string());
            let (key_pem, cert_pem) = crate::certs::selfsigned::generate(&[host])?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
                .context("generated key unparseable")?;
            (certs, key)
        }
    };

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("building TLS config")?;
    // The bidirectional channel wants full-duplex streams; advertise h2 so
    // clients negotiate it.
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_certificate_request_shapes() {
        let by_id: CertificateRequest =
            serde_json::from_str(r#"{"certificate_id": "abc"}"#).unwrap();
        assert_eq!(by_id.certificate_id.as_deref(), Some("abc"));

        let by_vault: CertificateRequest =
            serde_json::from_str(r#"{"vault_name": "kv", "vault_version": "3"}"#).unwrap();
        assert_eq!(by_vault.vault_name.as_deref(), Some("kv"));
        assert_eq!(by_vault.vault_version.as_deref(), Some("3"));
    }
}
