//! herdctl: operator CLI for HerdGuard backends

mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use herdcache::CacheConfig;
use herdstore::{RespBackend, RespConfig};
use tracing::info;

use crate::commands::Command;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    addr: String,

    /// Password sent with AUTH
    #[arg(short, long, env = "HERDCTL_PASSWORD")]
    password: Option<String>,

    /// Logical database
    #[arg(long)]
    db: Option<u32>,

    /// Cache configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CacheConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path))?,
        None => CacheConfig::default(),
    };

    let output = if args.command.is_offline() {
        commands::run_offline(&args.command, &config)?
    } else {
        let resp = RespConfig {
            addr: args.addr.clone(),
            password: args.password.clone(),
            database: args.db,
            ..RespConfig::default()
        };
        let backend = RespBackend::connect(resp)
            .await
            .with_context(|| format!("connecting to {}", args.addr))?;
        info!("Connected to {}", backend.addr());
        commands::run(&args.command, Arc::new(backend), &config).await?
    };

    println!("{}", output);
    Ok(())
}
