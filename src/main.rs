use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gradmesh::server::master::Master;
use gradmesh::server::plugin::ModelLibrary;
use gradmesh::server::worker::{self, WorkerConfig};
use gradmesh::training::Training;

#[derive(Parser)]
#[command(name = "gradmesh", about = "Distributed autodiff training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the authoritative weights to workers.
    Master {
        /// Weight snapshot, loaded at startup and written on SIGINT.
        weights_path: PathBuf,
        port: u16,
    },
    /// Pull weights, train a plug-in model, push deltas.
    Worker {
        host: String,
        port: u16,
        /// Dynamic library exporting create/destroy.
        model_path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("shutting down");
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("installing SIGINT handler")?;
    }

    match Cli::parse().command {
        Command::Master { weights_path, port } => {
            Master::new(port, Some(weights_path))
                .run(shutdown)
                .context("master failed")?;
        }
        Command::Worker {
            host,
            port,
            model_path,
        } => {
            let library = ModelLibrary::load(&model_path).context("loading model plug-in")?;
            let config = WorkerConfig::new(host, port);
            worker::run(
                &config,
                |idx| {
                    library
                        .instantiate(idx)
                        .map(|m| Box::new(m) as Box<dyn Training>)
                },
                &shutdown,
            )
            .context("worker failed")?;
        }
    }
    Ok(())
}
