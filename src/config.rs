use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use clap::ValueEnum;

pub const PRODUCTION_SETTINGS: &str = "/config/py-config-gs.json";
pub const DEVELOPMENT_SETTINGS: &str = "~/config/py-config-gs.json";

/// Whether privileged OS integrations (services, sensors, log tailing) are
/// actually invoked or stubbed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationalMode {
    Live,
    Simulated,
}

impl OperationalMode {
    pub fn is_live(self) -> bool {
        self == OperationalMode::Live
    }

    pub fn default_settings_path(self) -> PathBuf {
        match self {
            OperationalMode::Live => PathBuf::from(PRODUCTION_SETTINGS),
            OperationalMode::Simulated => expand_home(DEVELOPMENT_SETTINGS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: OperationalMode,
    pub settings_path: PathBuf,
    pub bind_addr: IpAddr,
    pub upload_dir: PathBuf,
    pub command_target: SocketAddr,
    pub soc_sensor: PathBuf,
    pub gpu_sensor: PathBuf,
    pub services: Vec<String>,
    pub version: String,
}

impl Config {
    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_addr, port)
    }

    pub fn key_path(&self) -> PathBuf {
        self.upload_dir.join("gs.key")
    }
}

/// Expands a leading `~` against the user's home directory. Paths without
/// one, or an unknown home, come back unchanged.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
