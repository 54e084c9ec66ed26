use std::{env, io, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dispatch_orders::DispatchService;
use dispatch_server::config::{self, CliServerOptions};
use tracing_subscriber::EnvFilter;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "dispatchd", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to the dispatch configuration file (TOML)
    #[arg(long = "config", value_name = "FILE", env = "DISPATCH_CONFIG")]
    config_path: Option<PathBuf>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Host binding for the HTTP server
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding for the HTTP server
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Enable the /events stream
    #[arg(long = "enable-sse", action = ArgAction::SetTrue)]
    enable_sse: bool,

    /// Disable the /events stream
    #[arg(long = "disable-sse", action = ArgAction::SetTrue)]
    disable_sse: bool,

    /// Persist orders and profiles to this JSON snapshot
    #[arg(long = "snapshot", value_name = "FILE")]
    snapshot_path: Option<PathBuf>,

    /// Bearer tokens provided via CLI
    #[arg(long = "auth-token", value_name = "TOKEN")]
    auth_tokens: Vec<String>,

    /// Path to JSON file containing authorized tokens
    #[arg(long = "tokens-file", value_name = "FILE")]
    tokens_file: Option<PathBuf>,

    /// Additional CORS allowed origins
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origins: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);
    tracing::info!(
        "{}",
        dispatch_build_info::formatted_banner("dispatchd", SERVER_VERSION)
    );

    let working_dir = env::current_dir().context("Failed to resolve working directory")?;

    let cli = CliServerOptions {
        host: args.host.clone(),
        port: args.port,
        enable_sse: match (args.enable_sse, args.disable_sse) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            _ => None,
        },
        snapshot_path: args.snapshot_path.clone(),
        tokens: args.auth_tokens.clone(),
        tokens_file: args.tokens_file.clone(),
        cors_origins: args.cors_origins.clone(),
    };

    let mut file = config::load_file_config(args.config_path.as_deref())?;
    let server_config = config::determine_server_config(&cli, &file.server, &working_dir)?;
    config::apply_cli_overrides(&cli, &mut file.dispatch);

    if server_config.auth.is_none() {
        tracing::warn!("no bearer tokens configured; the API is open to any caller");
    }

    let service = DispatchService::from_config(&file.dispatch)?;
    dispatch_server::run_http_server(service, server_config).await
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
