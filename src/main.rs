mod app;
mod config;
mod forwarder;
mod frontend;
mod gate;
mod identity;
mod invoker;
mod mux;
mod net;
mod state;
mod tunnel;

use clap::Parser;

use config::Config;

/// Default config file name.
const DEFAULT_CONFIG: &str = "rotor.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config file as env-var defaults (before clap parsing)
    let config_file_path =
        std::env::var("ROTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        match config::ConfigFile::load(config_path) {
            Ok(file_cfg) => file_cfg.inject_env(),
            Err(e) => eprintln!("  WARNING: failed to load {}: {}", config_file_path, e),
        }
    }

    let config = Config::parse();
    app::run(config).await
}
