//! `wireprobe` command-line runner.
//!
//! # Usage
//!
//! ```bash
//! wireprobe --config probe.json
//! wireprobe --host 10.0.0.5 --token s3cret --situation exchange.request_echo
//! wireprobe --list
//! ```
//!
//! # Exit Codes
//!
//! - 0: every situation passed
//! - 1: at least one situation failed, was skipped or crashed
//! - 2: configuration or internal error

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use wireprobe::auth::JsonHandshake;
use wireprobe::transport::QuicConnector;
use wireprobe::{situations, Engine, ProbeConfig, SituationContext, SituationRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "wireprobe", version)]
#[command(about = "Conformance probe for multiplexed binary stream servers")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Server port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Authentication token (overrides the config file)
    #[arg(long)]
    token: Option<String>,

    /// Situations allowed to run at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// List built-in situations and exit
    #[arg(long)]
    list: bool,

    /// Run only this situation and its dependencies (repeatable)
    #[arg(long = "situation", value_name = "ID")]
    situations: Vec<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(args: &Args) -> Result<ProbeConfig> {
    let mut config = match &args.config {
        Some(path) => ProbeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProbeConfig::default(),
    };
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(token) = &args.token {
        config.auth.token = token.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent_situations = concurrency;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_list(registry: &SituationRegistry, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            let listing: Vec<_> = registry
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id(),
                        "name": s.name(),
                        "dependencies": s.dependencies(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Format::Text => {
            for situation in registry.iter() {
                let deps = situation.dependencies();
                if deps.is_empty() {
                    println!("{:<36} {}", situation.id(), situation.name());
                } else {
                    println!(
                        "{:<36} {} (after {})",
                        situation.id(),
                        situation.name(),
                        deps.join(", ")
                    );
                }
            }
            println!("\nTotal: {} situations", registry.len());
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<bool> {
    let catalogue = situations::builtin()?;
    if args.list {
        print_list(&catalogue, args.format)?;
        return Ok(true);
    }

    let config = load_config(&args)?;
    let registry = if args.situations.is_empty() {
        catalogue
    } else {
        let ids: Vec<&str> = args.situations.iter().map(String::as_str).collect();
        catalogue.closure(&ids)?
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        situations = registry.len(),
        "starting probe"
    );
    let authenticator = JsonHandshake::new(config.timeouts.read());
    let context = SituationContext::new(config, Arc::new(QuicConnector::new()), Arc::new(authenticator));
    let report = Engine::new(registry, context).run().await?;

    match args.format {
        Format::Text => print!("{}", report.render_text()),
        Format::Json => println!("{}", report.to_json()?),
    }
    Ok(report.all_passed())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
