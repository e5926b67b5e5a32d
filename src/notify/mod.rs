use crate::config::NotificationsConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Outbound notification collaborator. The sync runner posts one message
/// per failing site; delivery failures are logged, never fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Webhook notifier with per-message dedup: each distinct (site, error)
/// string is delivered at most once per process lifetime, so a site that
/// stays broken across many syncs does not spam the channel.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    key: Option<String>,
    sent: Mutex<HashSet<String>>,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationsConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.webhook_url.is_empty(),
            "webhook notifications enabled without a URL"
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            url: config.webhook_url.clone(),
            key: config.webhook_key.clone(),
            sent: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        if !self.sent.lock().unwrap().insert(message.to_string()) {
            return Ok(());
        }

        let mut req = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "message": message }));
        if let Some(key) = &self.key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("notify: webhook delivered");
            }
            Ok(resp) => {
                warn!("notify: webhook rejected, status={}", resp.status());
            }
            Err(e) => {
                warn!("notify: webhook failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Used when notifications are not configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingNotifier {
        delivered: Arc<AtomicUsize>,
        sent: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, message: &str) -> Result<()> {
            if !self.sent.lock().unwrap().insert(message.to_string()) {
                return Ok(());
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dedup_semantics() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let notifier = CountingNotifier {
            delivered: delivered.clone(),
            sent: Mutex::new(HashSet::new()),
        };

        notifier.notify("site a.example: signature mismatch").await.unwrap();
        notifier.notify("site a.example: signature mismatch").await.unwrap();
        notifier.notify("site b.example: signature mismatch").await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_webhook_requires_url() {
        let config = NotificationsConfig {
            method: "webhook".to_string(),
            webhook_url: String::new(),
            webhook_key: None,
        };
        assert!(WebhookNotifier::new(&config).is_err());
    }
}
