use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use download_orchestrator::api::telemetry::init_tracing;
use download_orchestrator::config::OrchestratorConfig;
use download_orchestrator::gateway_from_config;
use download_orchestrator::server::handler::DownloadServer;

#[derive(Debug, Parser)]
#[command(name = "download-orchestrator", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Worker executable
    #[arg(long)]
    worker: Option<String>,

    /// Arguments passed to the worker before the filename (repeatable)
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    /// Directory the worker writes downloads into
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Reject pause/resume instead of signalling the worker
    #[arg(long)]
    no_signal_control: bool,
}

impl Args {
    fn into_config(self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::load(path)?,
            None => OrchestratorConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(worker) = self.worker {
            config.worker.program = worker;
        }
        if !self.worker_args.is_empty() {
            config.worker.args = self.worker_args;
        }
        if let Some(output_dir) = self.output_dir {
            config.worker.output_dir = output_dir;
        }
        if self.no_signal_control {
            config.worker.signal_control = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Args::parse().into_config()?;
    info!(
        "worker: {} {:?}, output dir {}",
        config.worker.program,
        config.worker.args,
        config.worker.output_dir.display()
    );

    let gateway = gateway_from_config(&config);
    let server = DownloadServer::start(gateway.clone(), config.listen_addr).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    gateway.registry().shutdown().await;
    server.shutdown().await;
    Ok(())
}
