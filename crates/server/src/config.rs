use std::path::Path;

use airbridge_protocol::BridgeConfig;
use anyhow::{Context, Result};

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(BridgeConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: BridgeConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/airbridge.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconnect.confirmation_checks, 5);
        assert_eq!(config.reconnect.cooldown_secs, 5);
        assert_eq!(config.reconnect.startup_grace_secs, 30);
        assert_eq!(config.reconnect.window_wait_secs, 60);
        assert_eq!(config.capture.display, ":0");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [ice]
            nat_host_ip = "10.0.0.7"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.ice.nat_host_ip, "10.0.0.7");
        assert_eq!(config.reconnect.confirmation_checks, 5);
        assert!(!config.paths.receiver_log_paths.is_empty());
    }
}
