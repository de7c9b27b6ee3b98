//! Server settings
//!
//! Layered with the `config` crate: an optional TOML file, then environment
//! variables prefixed `STREAMTUNE` with `__` between nested keys, e.g.
//! `STREAMTUNE_SERVER__PORT=9000` or `STREAMTUNE_ENGINE__BUFFER__MAX_SIZE=800`.

use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use streamtune_core::{EngineConfig, ServerConfig};

/// Everything the server reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub controller: ControllerSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    /// Devices registered at startup
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
}

/// HTTP renderer control endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_status_path")]
    pub status_path: String,

    #[serde(default = "default_control_path")]
    pub control_path: String,

    /// Timeout for play/volume/stop requests; probes use the engine's probe timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            status_path: default_status_path(),
            control_path: default_control_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Stream relay location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Pull URL with a `{device}` placeholder; no relay when unset
    #[serde(default)]
    pub url_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSeed {
    pub id: String,
    pub host: String,
    pub port: u16,
}

fn default_status_path() -> String {
    "/status".to_string()
}

fn default_control_path() -> String {
    "/control".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

/// `$STREAMTUNE_CONFIG`, else `<config dir>/streamtune/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    std::env::var_os("STREAMTUNE_CONFIG")
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("streamtune").join("config.toml")))
}

pub fn load() -> anyhow::Result<ServerSettings> {
    let mut builder = Config::builder();
    if let Some(path) = config_path() {
        builder = builder.add_source(File::from(path).required(false));
    }
    let settings = builder
        .add_source(
            Environment::with_prefix("STREAMTUNE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let settings: ServerSettings = Config::builder()
            .add_source(File::from_str(
                r#"
                [server]
                port = 9100

                [engine.buffer]
                max_size = 800

                [relay]
                url_template = "http://10.0.0.5:8090/stream/{device}"

                [[devices]]
                id = "kitchen"
                host = "10.0.0.20"
                port = 7000
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.engine.buffer.max_size, 800);
        assert_eq!(settings.engine.buffer.min_size, 100);
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.controller.status_path, "/status");
        assert!(settings.engine.validate().is_ok());
    }
}
