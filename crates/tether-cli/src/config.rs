//! Tether CLI configuration
//!
//! Layered with figment, lowest priority first:
//! - built-in defaults
//! - `tether.toml` in the working directory
//! - `config.toml` in the per-user config directory
//! - the file given with `--config`
//! - `TETHER_*` environment variables (`__` separates nesting, e.g.
//!   `TETHER_BLE__RSSI_THRESHOLD=-60`)
//! - command line flags

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use tether_ble::BleConfig;

use crate::cli::Cli;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the `tether` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CliAppConfig {
    pub identity: IdentityConfig,
    /// Engine, discovery and handshake tunables
    pub ble: BleConfig,
    pub log: LogConfig,
}

/// Who this node is and where it keeps its state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name carried in the advertisement and profile
    pub display_name: String,
    /// Optional avatar URL served in the profile
    pub profile_photo: Option<String>,
    /// Holds `identity.seed` and `connections.json`; defaults to the user data dir
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub verbose: bool,
    /// `EnvFilter` directive; wins over `verbose` when set
    pub filter: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            display_name: "tether".to_string(),
            profile_photo: None,
            data_dir: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Load with every layer, applying the overrides given on the command line
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Self::base_figment(cli.config.as_deref())?;
        if let Some(name) = &cli.name {
            figment = figment.merge(("identity.display_name", name));
        }
        if let Some(data_dir) = &cli.data_dir {
            figment = figment.merge(("identity.data_dir", data_dir));
        }
        if cli.verbose {
            figment = figment.merge(("log.verbose", true));
        }
        Self::extract(figment)
    }

    /// Defaults, files and environment, without command line overrides
    fn base_figment(explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("tether.toml"));
        if let Some(dir) = dirs::config_dir() {
            figment = figment.merge(Toml::file(dir.join("tether").join("config.toml")));
        }
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        Ok(figment.merge(Env::prefixed("TETHER_").split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: CliAppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.identity.display_name.trim().is_empty() {
            return Err(CliError::Config("display name must not be empty".into()));
        }
        if !(-127..=0).contains(&self.ble.rssi_threshold) {
            return Err(CliError::Config(format!(
                "rssi_threshold {} is outside -127..=0 dBm",
                self.ble.rssi_threshold
            )));
        }
        if self.ble.follow_token_interval_ms == 0 {
            return Err(CliError::Config(
                "follow_token_interval_ms must be greater than 0".into(),
            ));
        }
        if self.ble.default_mtu == 0 || self.ble.command_buffer == 0 || self.ble.event_capacity == 0
        {
            return Err(CliError::Config(
                "default_mtu, command_buffer and event_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding the identity seed and connection records
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.identity.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("tether"))
                .ok_or_else(|| CliError::Config("no data directory; pass --data-dir".into())),
        }
    }

    /// Example configuration file content
    pub fn example_config() -> String {
        let example = CliAppConfig {
            identity: IdentityConfig {
                display_name: "ada".to_string(),
                profile_photo: Some("https://example.com/ada.png".to_string()),
                data_dir: None,
            },
            ..Default::default()
        };
        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = CliAppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn file_environment_and_flags_layer_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tether.toml",
                r#"
                [identity]
                display_name = "from-file"

                [ble]
                rssi_threshold = -60
                connect_timeout_ms = 5000
                "#,
            )?;
            jail.set_env("TETHER_BLE__RSSI_THRESHOLD", "-55");
            jail.set_env("TETHER_BLE__HANDSHAKE__AUTO_ACCEPT", "false");

            let config = CliAppConfig::extract(CliAppConfig::base_figment(None).unwrap()).unwrap();
            assert_eq!(config.identity.display_name, "from-file");
            assert_eq!(config.ble.rssi_threshold, -55);
            assert_eq!(config.ble.connect_timeout_ms, 5000);
            assert!(!config.ble.handshake.auto_accept);

            let cli = Cli::parse_from(["tether", "--name", "from-flag", "identity"]);
            let config = CliAppConfig::load(&cli).unwrap();
            assert_eq!(config.identity.display_name, "from-flag");
            assert_eq!(config.ble.rssi_threshold, -55);
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("TETHER_BLE__FOLLOW_TOKEN_INTERVAL_MS", "0");
            let result = CliAppConfig::extract(CliAppConfig::base_figment(None).unwrap());
            assert!(matches!(result, Err(CliError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = CliAppConfig::base_figment(Some(Path::new("/nonexistent/tether.toml")));
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn example_config_parses_back() {
        let example = CliAppConfig::example_config();
        let parsed: CliAppConfig = toml::from_str(&example).unwrap();
        assert_eq!(parsed.identity.display_name, "ada");
        assert!(parsed.validate().is_ok());
    }
}
