use anyhow::Context;
use base64::Engine;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::config::EtcdConfig;

/// etcd v3 client speaking the gRPC-Gateway HTTP/JSON endpoints
/// (`/v3/kv/*`, `/v3/watch`, `/v3/lease/*`, `/v3/auth/authenticate`),
/// which keeps the build free of protoc.
///
/// Cheaply cloneable; the inner `reqwest::Client` is an `Arc`.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

/// The JSON gateway emits 64-bit numbers as strings on newer etcd
/// releases; accept both spellings.
fn i64_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Serialize)]
struct AuthRequest {
    name: String,
    password: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "i64_or_string")]
    pub revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "i64_or_string")]
    pub mod_revision: Option<i64>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    keys_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<i64>,
}

#[derive(Deserialize)]
pub struct PutResponse {
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Serialize)]
struct DeleteRangeRequest {
    key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    range_end: String,
}

#[derive(Deserialize)]
pub struct DeleteResponse {
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

// Transaction support is limited to what the lock path needs: a single
// create-revision compare guarding a single put.

#[derive(Serialize)]
struct TxnCompare {
    key: String,
    target: &'static str,
    result: &'static str,
    create_revision: String,
}

#[derive(Serialize)]
struct TxnPutOp {
    request_put: PutRequest,
}

#[derive(Serialize)]
struct TxnRequest {
    compare: Vec<TxnCompare>,
    success: Vec<TxnPutOp>,
}

#[derive(Deserialize)]
pub struct TxnResponse {
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub header: Option<ResponseHeader>,
}

#[derive(Serialize)]
struct WatchCreateRequest {
    create_request: WatchCreate,
}

#[derive(Serialize)]
struct WatchCreate {
    key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_revision: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub result: Option<WatchResult>,
}

#[derive(Deserialize)]
pub struct WatchResult {
    #[serde(default)]
    pub events: Vec<WatchEvent>,
    #[serde(default)]
    pub header: Option<ResponseHeader>,
}

#[derive(Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    pub kv: Option<KeyValue>,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: u64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: Option<String>,
}

#[derive(Serialize)]
struct LeaseKeepAliveRequest {
    #[serde(rename = "ID")]
    id: i64,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResponse {
    result: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    id: i64,
}

pub fn b64_encode(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
    Ok(String::from_utf8(bytes)?)
}

/// Smallest key strictly greater than every key under `prefix`.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return base64::engine::general_purpose::STANDARD.encode(&end);
        }
    }
    String::new()
}

impl EtcdClient {
    /// Try each configured endpoint in order and keep the first one that
    /// answers (and accepts our credentials, when any are configured).
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !cfg.endpoints.is_empty(),
            "etcd requires at least one endpoint"
        );

        let http = reqwest::Client::new();
        let mut failures: Vec<String> = Vec::new();

        for endpoint in &cfg.endpoints {
            let candidate = Self {
                http: http.clone(),
                base_url: endpoint.trim_end_matches('/').to_string(),
                auth_token: None,
            };
            match candidate.establish(cfg).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!("etcd: skipping endpoint {}: {:#}", endpoint, e);
                    failures.push(format!("{}: {:#}", endpoint, e));
                }
            }
        }

        anyhow::bail!("no usable etcd endpoint ({})", failures.join("; "))
    }

    /// Authenticate against one endpoint, or probe its liveness with a
    /// maintenance-status call when no credentials are configured.
    async fn establish(mut self, cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            let auth: AuthResponse = self
                .http
                .post(format!("{}/v3/auth/authenticate", self.base_url))
                .json(&AuthRequest {
                    name: user.clone(),
                    password: pass.clone(),
                })
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            self.auth_token = auth.token;
        } else {
            self.http
                .post(format!("{}/v3/maintenance/status", self.base_url))
                .json(&serde_json::json!({}))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, path: &str, body: &impl Serialize) -> anyhow::Result<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", token);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("etcd request to {}", path))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        anyhow::bail!("etcd rejected {} with {}: {}", path, status, detail.trim())
    }

    /// Fetch one key. Returns the decoded value and its mod revision.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<(String, i64)>> {
        let resp = self.range_raw(key, "", false).await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => {
                let value = b64_decode(&kv.value)?;
                Ok(Some((value, kv.mod_revision.unwrap_or(0))))
            }
            None => Ok(None),
        }
    }

    /// Fetch every key under `prefix`. Returns decoded (key, value) pairs
    /// plus the store revision of the response.
    pub async fn get_prefix(&self, prefix: &str) -> anyhow::Result<(Vec<(String, String)>, i64)> {
        let resp = self
            .range_raw(prefix, &prefix_range_end(prefix), false)
            .await?;
        let revision = resp.header.as_ref().and_then(|h| h.revision).unwrap_or(0);

        let mut items = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            let key = match b64_decode(&kv.key) {
                Ok(k) => k,
                Err(_) => continue,
            };
            match b64_decode(&kv.value) {
                Ok(value) => items.push((key, value)),
                Err(e) => warn!("etcd: skipping undecodable value at {}: {}", key, e),
            }
        }
        Ok((items, revision))
    }

    /// List key names under `prefix` (values are not transferred).
    pub async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let resp = self
            .range_raw(prefix, &prefix_range_end(prefix), true)
            .await?;
        Ok(resp
            .kvs
            .iter()
            .filter_map(|kv| b64_decode(&kv.key).ok())
            .collect())
    }

    async fn range_raw(
        &self,
        key: &str,
        range_end: &str,
        keys_only: bool,
    ) -> anyhow::Result<RangeResponse> {
        let req = RangeRequest {
            key: b64_encode(key),
            range_end: range_end.to_string(),
            keys_only: if keys_only { Some(true) } else { None },
        };
        Ok(self.call("/v3/kv/range", &req).await?.json().await?)
    }

    /// Put a key; returns the resulting store revision.
    pub async fn put(&self, key: &str, value: &str, lease: Option<i64>) -> anyhow::Result<i64> {
        let req = PutRequest {
            key: b64_encode(key),
            value: b64_encode(value),
            lease,
        };
        let resp: PutResponse = self.call("/v3/kv/put", &req).await?.json().await?;
        Ok(resp.header.and_then(|h| h.revision).unwrap_or(0))
    }

    /// Put `key` only if it does not exist yet. Returns true when the put
    /// was applied (the compare on create_revision == 0 succeeded).
    pub async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> anyhow::Result<bool> {
        let req = TxnRequest {
            compare: vec![TxnCompare {
                key: b64_encode(key),
                target: "CREATE",
                result: "EQUAL",
                create_revision: "0".to_string(),
            }],
            success: vec![TxnPutOp {
                request_put: PutRequest {
                    key: b64_encode(key),
                    value: b64_encode(value),
                    lease,
                },
            }],
        };
        let resp: TxnResponse = self.call("/v3/kv/txn", &req).await?.json().await?;
        Ok(resp.succeeded)
    }

    /// Delete a single key; returns the resulting store revision.
    pub async fn delete(&self, key: &str) -> anyhow::Result<i64> {
        let req = DeleteRangeRequest {
            key: b64_encode(key),
            range_end: String::new(),
        };
        let resp: DeleteResponse = self.call("/v3/kv/deleterange", &req).await?.json().await?;
        Ok(resp.header.and_then(|h| h.revision).unwrap_or(0))
    }

    /// Delete every key under `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        let req = DeleteRangeRequest {
            key: b64_encode(prefix),
            range_end: prefix_range_end(prefix),
        };
        self.call("/v3/kv/deleterange", &req).await?;
        Ok(())
    }

    pub async fn lease_grant(&self, ttl: u64) -> anyhow::Result<i64> {
        let grant: LeaseGrantResponse = self
            .call("/v3/lease/grant", &LeaseGrantRequest { ttl })
            .await?
            .json()
            .await?;
        // The gateway encodes the id as a decimal string; 0 means etcd
        // refused the grant.
        grant
            .id
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|id| *id != 0)
            .context("etcd granted an unusable lease id")
    }

    pub async fn lease_keepalive(&self, lease_id: i64) -> anyhow::Result<()> {
        let ka: LeaseKeepAliveResponse = self
            .call("/v3/lease/keepalive", &LeaseKeepAliveRequest { id: lease_id })
            .await?
            .json()
            .await?;
        // An empty result means the lease no longer exists on the server.
        anyhow::ensure!(ka.result.is_some(), "lease {} is gone, grant a new one", lease_id);
        Ok(())
    }

    pub async fn lease_revoke(&self, lease_id: i64) -> anyhow::Result<()> {
        self.call("/v3/lease/revoke", &LeaseRevokeRequest { id: lease_id })
            .await?;
        Ok(())
    }

    /// Open a watch over `prefix` (or a single key when `prefix` is exact
    /// and `range` is false). The returned stream yields parsed responses;
    /// the caller owns the reconnect loop.
    pub async fn watch(
        &self,
        key: &str,
        range: bool,
        start_revision: Option<i64>,
    ) -> anyhow::Result<WatchStream> {
        let req = WatchCreateRequest {
            create_request: WatchCreate {
                key: b64_encode(key),
                range_end: if range {
                    prefix_range_end(key)
                } else {
                    String::new()
                },
                start_revision,
            },
        };
        let resp = self.call("/v3/watch", &req).await?;
        Ok(WatchStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }
}

/// A streaming watch connection parsing newline-delimited JSON responses.
pub struct WatchStream {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl WatchStream {
    /// Read the next response; `None` when the stream ends.
    pub async fn next_response(&mut self) -> Option<WatchResponse> {
        loop {
            // Drain complete lines already buffered before touching the
            // network again.
            while let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WatchResponse>(&line) {
                    Ok(resp) => return Some(resp),
                    Err(e) => warn!("etcd: dropping malformed watch line ({}): {}", e, line),
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    warn!("etcd: watch transport failed: {}", e);
                    return None;
                }
                None => {
                    // Server closed the stream; a trailing unterminated
                    // line may still hold one last response.
                    let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
                    self.buf.clear();
                    if rest.is_empty() {
                        return None;
                    }
                    return serde_json::from_str::<WatchResponse>(&rest).ok();
                }
            }
        }
    }

    /// Pop one newline-terminated line off the buffer, trimmed. `None`
    /// when no full line is buffered yet.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw = self.buf.split_to(pos + 1);
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }
}
