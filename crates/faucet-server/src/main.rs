//! Main entry point for the faucet server.

use anyhow::Result;
use clap::{Arg, Command};
use faucet_server::{config::FaucetConfig, http::start_server};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let matches = Command::new("faucet-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Faucet backend - dispenses ETH and ERC-20 tokens with rate limiting and captcha gating")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .default_value("faucet-config.toml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();

    if matches.get_flag("generate-config") {
        return generate_config(config_path);
    }

    info!("loading configuration from {}", config_path);

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            error!("use --generate-config to create a default configuration file");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        error!("configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "server will bind to {}:{}, rpc {}",
        config.http.bind_address, config.http.port, config.ethereum.rpc_url
    );

    if let Err(e) = start_server(config).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Load configuration from file
fn load_config(path: &str) -> Result<FaucetConfig> {
    if !Path::new(path).exists() {
        return Err(anyhow::anyhow!(
            "Configuration file '{}' not found. Use --generate-config to create one.",
            path
        ));
    }

    FaucetConfig::from_file(path).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
}

/// Generate a default configuration file
fn generate_config(path: &str) -> Result<()> {
    let config = FaucetConfig::default();

    config.save_to_file(path)?;

    println!("Generated default configuration file: {}", path);
    println!();
    println!("Before running the server:");
    println!("1. Set the faucet private key (ethereum.private_key)");
    println!("2. Point ethereum.rpc_url at your node");
    println!("3. Set ethereum.token_address if token payouts are wanted");
    println!("4. Set the hCaptcha site key and secret (captcha section)");
    println!("5. Adjust payouts and the rate-limit window as needed");

    Ok(())
}
