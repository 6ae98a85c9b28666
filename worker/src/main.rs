use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use ops::Ops;
use spindle::{config::Config, worker::WorkerRuntime};
use tracing::{error, info};

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    /// Address to accept task connections on.
    #[arg(long, env = "SPINDLE_WORKER_ADDR", default_value = "127.0.0.1:7077")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub options: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();

    let runtime: WorkerRuntime<Ops> = WorkerRuntime::from_config(&args.options, args.listen).await?;
    runtime
        .serve_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received ctrl-c"),
                Err(e) => {
                    error!("Failed to listen for ctrl-c {e}");
                    std::future::pending::<()>().await
                }
            }
        })
        .await
}
