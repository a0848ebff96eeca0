//! snirelay: a transparent relay that forwards TLS by SNI and plain
//! HTTP by Host header, against a hot-swappable hostname allow-list.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use snirelay_shared::rules::RuleSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod console;
mod dialer;
mod http;
mod https;

use config::Config;
use console::Console;
use dialer::Dialer;
use http::HttpProxy;
use https::HttpsProxy;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "snirelay")]
#[command(version)]
#[command(about = "Transparent TLS/HTTP relay routed by SNI", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose)?;

    let outip = config.outip()?;
    let dialer = Dialer::new(outip, DIAL_TIMEOUT);

    let rules = Arc::new(RuleSet::new(config.client.passthrough));
    let rules_path = config
        .client
        .rules
        .as_ref()
        .map(|path| config.file_location(path));
    if let Some(path) = &rules_path {
        let data = std::fs::read(path)
            .with_context(|| format!("load rules file {}", path.display()))?;
        rules
            .put_json(&data)
            .await
            .with_context(|| format!("parse rules file {}", path.display()))?;
        info!("loaded rules from {}", path.display());
    }

    let https_addrs = config::listen_addrs(&config.https.listen);
    let http_addrs = config::listen_addrs(&config.http.listen);
    if https_addrs.is_empty() && http_addrs.is_empty() {
        bail!("neither http nor https server configured, quitting");
    }

    let _console = Console::new(
        Arc::clone(&rules),
        rules_path,
        config.console.listen.clone(),
    )
    .start()
    .await?;

    let mut servers = Vec::new();
    for listen in https_addrs {
        servers.push(
            HttpsProxy::new(Arc::clone(&rules), dialer.clone(), listen)
                .start()
                .await?,
        );
    }
    for listen in http_addrs {
        servers.push(
            HttpProxy::new(Arc::clone(&rules), outip, listen)?
                .start()
                .await?,
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.global.logfile {
        Some(logfile) => {
            let path = config.file_location(logfile);
            let file = std::fs::File::create(&path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}
