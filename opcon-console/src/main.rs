//! opcon console: entry point.
//!
//! ```text
//! opcon-console                       Run with opcon-console.toml (or defaults)
//! opcon-console --config <path>       Load a custom config TOML
//! opcon-console --gen-config          Write default config to stdout
//! opcon-console --write-config        Write default config to the --config path
//! opcon-console --url <url>           Override the video source
//! opcon-console --broker <addr>       Override the broker address
//! opcon-console --no-video            Control only, no decoding
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use opcon_console::{Console, ConsoleConfig};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "opcon-console", about = "Remote-operation console: live video plus device control")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "opcon-console.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the --config path and exit.
    #[arg(long)]
    write_config: bool,

    /// RTMP/RTSP source, overriding the config file.
    #[arg(long)]
    url: Option<String>,

    /// Broker address, overriding the config file.
    #[arg(long)]
    broker: Option<String>,

    /// Do not decode video.
    #[arg(long)]
    no_video: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ConsoleConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if cli.write_config {
        ConsoleConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    // Load config.
    let mut config = ConsoleConfig::load(&cli.config);
    if let Some(url) = cli.url {
        config.stream.url = url;
    }
    if let Some(broker) = cli.broker {
        config.broker.address = broker;
    }
    if cli.no_video {
        config.stream.enabled = false;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("opcon-console v{}", env!("CARGO_PKG_VERSION"));
    info!("broker: {}", config.broker.address);
    if config.stream.enabled {
        info!("video: {}", config.stream.url);
    }

    let console = Console::start(config).await?;
    console.run().await?;

    Ok(())
}
