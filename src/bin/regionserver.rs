//! Region server entry point.
//!
//! `regionserver start [--bind host:port]` runs a server against the
//! configured root directory. There is no `stop` subcommand on purpose:
//! servers are stopped by the master or by signal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cinderdb::error::Result;
use cinderdb::master::{Instruction, MasterClient, Report, ServerInfo};
use cinderdb::{Config, RegionServer};

#[derive(Parser, Debug)]
#[command(name = "regionserver")]
#[command(about = "CinderDB region server")]
#[command(version)]
struct Args {
    /// Configuration properties file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start serving regions.
    Start {
        /// Address to bind the region service to (host:port).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Refused: region servers are stopped via the master or by signal.
    Stop,
}

/// Placeholder master used until the deployment wires in its RPC stub: it
/// accepts the handshake and reports but never issues instructions.
struct NullMaster;

#[async_trait::async_trait]
impl MasterClient for NullMaster {
    async fn region_server_startup(&self, _info: ServerInfo) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn region_server_report(
        &self,
        _info: ServerInfo,
        _reports: Vec<Report>,
    ) -> Result<Vec<Instruction>> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cinderdb=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let bind = match args.command {
        Command::Start { bind } => bind,
        Command::Stop => {
            eprintln!(
                "there is no regionserver stop mechanism; \
                 to stop region servers, shut down the master"
            );
            std::process::exit(1);
        }
    };

    let mut config = match args.config {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(bind) = bind {
        config.bind_address = bind;
    }

    tracing::info!(
        version = cinderdb::VERSION,
        root = %config.root_dir.display(),
        bind = %config.bind_address,
        "starting region server"
    );

    let server = match RegionServer::new(config, Arc::new(NullMaster)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "cannot start region server");
            std::process::exit(1);
        }
    };

    let signalled = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signalled.stop();
        }
    });

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "region server exited with error");
        std::process::exit(1);
    }
}
