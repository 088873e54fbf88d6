use clap::Parser;
use nocturne_c2::config::LogFormat;
use nocturne_c2::plugin::StandardAgentFamily;
use nocturne_c2::{ServerConfig, Teamserver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nocturne_c2")]
#[command(about = "Nocturne C2 Teamserver Core - Authorized Security Testing Only")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Generate config if requested
    if let Some(path) = cli.generate_config {
        let config = ServerConfig::default();
        config.save_to_file(&path)?;
        println!("Default configuration written to: {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = if let Some(path) = cli.config {
        ServerConfig::from_file(&path)?
    } else {
        ServerConfig::default()
    };

    let level = cli.log_level.unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.init(),
    }

    let server = Arc::new(Teamserver::new(config));
    server
        .plugins()
        .register_agent_family("standard", Arc::new(StandardAgentFamily));

    server.run().await?;
    Ok(())
}
