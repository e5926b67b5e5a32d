use crate::config::NginxConfig;
use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

/// Drives the proxy process through the configured shell commands. The
/// renderer and sync runner are the only callers, and they run inside the
/// singleflighted sync, so commands never race each other.
pub struct NginxControl {
    config: NginxConfig,
}

impl NginxControl {
    pub fn new(config: NginxConfig) -> Self {
        Self { config }
    }

    pub fn config_dir(&self) -> &str {
        &self.config.config_dir
    }

    pub async fn is_running(&self) -> bool {
        match run(&self.config.status_command).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let output = run(&self.config.start_command).await?;
        anyhow::ensure!(
            output.status.success(),
            "start command failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        info!("nginx: started");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let output = run(&self.config.restart_command).await?;
        anyhow::ensure!(
            output.status.success(),
            "restart command failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        info!("nginx: restarted");
        Ok(())
    }

    /// Start the proxy when it is not running. Returns true when a start
    /// was performed.
    pub async fn ensure_running(&self) -> Result<bool> {
        if self.is_running().await {
            return Ok(false);
        }
        self.start().await?;
        Ok(true)
    }
}

async fn run(command: &str) -> Result<std::process::Output> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("running: {}", command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(status: &str, start: &str, restart: &str) -> NginxControl {
        NginxControl::new(NginxConfig {
            config_dir: "/tmp".to_string(),
            status_command: status.to_string(),
            start_command: start.to_string(),
            restart_command: restart.to_string(),
        })
    }

    #[tokio::test]
    async fn test_status_reflects_exit_code() {
        assert!(control("true", "true", "true").is_running().await);
        assert!(!control("false", "true", "true").is_running().await);
    }

    #[tokio::test]
    async fn test_ensure_running_starts_once_needed() {
        assert!(!control("true", "false", "true").ensure_running().await.unwrap());
        assert!(control("false", "true", "true").ensure_running().await.unwrap());
        assert!(control("false", "false", "true").ensure_running().await.is_err());
    }

    #[tokio::test]
    async fn test_restart_failure_carries_stderr() {
        let err = control("true", "true", "echo boom >&2; false")
            .restart()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
