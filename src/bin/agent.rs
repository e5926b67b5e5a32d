#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use statiko::agent;
use statiko::config::AppConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "statiko-agent", about = "statiko edge node agent")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "/etc/statiko/agent.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(statiko::runtime::worker_threads())
        .enable_all()
        .build()?;

    rt.block_on(async {
        statiko::runtime::init_tracing();
        let config = AppConfig::load(&cli.config)?;
        agent::run(config).await
    })
}
