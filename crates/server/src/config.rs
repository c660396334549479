use std::path::{Path, PathBuf};

use anyhow::Context;
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "streamer.db";
pub const CONTROL_DIR: &str = "control";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub dbpath: PathBuf,
    pub debug: bool,
    /// Unset means "enabled when a `control/` folder exists".
    pub control_panel: Option<bool>,
    pub scripts: PathBuf,
    pub obs: ObsSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObsSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Seconds allowed for connecting and identifying before the surface is
    /// given up on.
    pub handshake_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 2525,
            dbpath: PathBuf::from("db"),
            debug: false,
            control_panel: None,
            scripts: Path::new(CONTROL_DIR).join("scripts.toml"),
            obs: ObsSettings::default(),
        }
    }
}

impl Default for ObsSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 4455,
            password: None,
            handshake_timeout_secs: 10,
        }
    }
}

impl Settings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_url(&self) -> String {
        let path = self.dbpath.join(DATABASE_FILE);
        format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
    }

    pub fn control_panel_enabled(&self, root: &Path) -> bool {
        self.control_panel
            .unwrap_or_else(|| root.join(CONTROL_DIR).is_dir())
    }
}

impl ObsSettings {
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Defaults, then the JSON config file, then `APP__*` environment variables
/// (`APP__PORT`, `APP__OBS__PASSWORD`, ...).
///
/// The default `config.json` is optional; an explicitly named file is not.
/// A file that exists but does not parse is an error.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let (file, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    Config::builder()
        .add_source(
            File::from(file.as_path())
                .format(FileFormat::Json)
                .required(required),
        )
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load configuration from {}", file.display()))?
        .try_deserialize()
        .with_context(|| format!("invalid configuration in {}", file.display()))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
