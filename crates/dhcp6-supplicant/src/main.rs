//! DHCPv6 supplicant binary

use dhcp6_supplicant::{Config, Supervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    let level = config.logging.level.clone().unwrap_or_else(|| "info".to_string());
    match config.logging.format.as_deref() {
        Some("json") => common::logging::init_json(&level),
        _ => common::logging::init(&level),
    }

    tracing::info!("dhcp6 supplicant starting");

    let mut supervisor = Supervisor::new(config);
    supervisor.start()?;
    supervisor.run().await?;

    Ok(())
}
