use std::sync::Arc;
use tokio::sync::Notify;

/// Worker threads for the tokio runtime, respecting container CPU limits.
///
/// Order: `STATIKO_CPU_LIMIT` env override, then the cgroup v2 quota, then
/// the host CPU count. Without this a limited container would spawn one
/// thread per host core.
pub fn worker_threads() -> usize {
    if let Some(n) = std::env::var("STATIKO_CPU_LIMIT")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return n.max(1);
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(n) = parse_cgroup_cpu_max(&max) {
            return n.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// cgroup v2 `cpu.max` is "quota period" or "max period" (unlimited).
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota: i64 = parts.next()?.parse().ok()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

/// Block until SIGINT or SIGTERM, then notify every background loop.
pub async fn wait_for_termination(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("runtime: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("runtime: received SIGTERM, shutting down"),
    }
    shutdown.notify_waiters();
}

/// Tracing setup shared by both binaries: JSON lines on stdout through a
/// non-blocking writer, level from `RUST_LOG` (default info).
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer lives for the whole process.
    std::mem::forget(guard);
}
