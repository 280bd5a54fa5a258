//! Server configuration: TOML file + environment/CLI overrides.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use termhub_core::{TermError, TermResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shell: default_shell(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_buffer_size() -> usize {
    2 * 1024 * 1024
}

/// Values that take precedence over the config file. The binary fills these
/// from CLI flags, which clap in turn falls back to `APP_*` variables for.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub buffer_size: Option<usize>,
}

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub shell: String,
    pub buffer_size: usize,
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TermError::Config(format!("{}: {e}", expanded.display())))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let server = file_config.server;
        let shell = overrides
            .shell
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(server.shell);

        Ok(Self {
            bind: overrides.bind.unwrap_or(server.bind),
            port: overrides.port.unwrap_or(server.port),
            shell,
            buffer_size: overrides.buffer_size.unwrap_or(server.buffer_size),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
