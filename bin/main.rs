use std::path::{Path, PathBuf};

use anyhow::Context;
use smtp_relay::{config::Config, controller::Controller};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

const CONFIG_LOCATIONS: [&str; 2] = ["./relay.toml", "/etc/smtp-relay/relay.toml"];

/// `RELAY_CONFIG` when set, otherwise the first well-known location that exists.
fn find_config_file() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("RELAY_CONFIG").filter(|path| !path.is_empty()) {
        return Some(PathBuf::from(path));
    }

    CONFIG_LOCATIONS
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

fn load_config() -> anyhow::Result<Config> {
    let mut config = match find_config_file() {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    Controller::new(config).run().await?;

    println!("Shutting down...");

    Ok(())
}
