use anyhow::{Context, Result};
use clap::Parser;
use std::{net::IpAddr, path::PathBuf, sync::Arc};
use tracing::{info, Level};

mod config;
mod error;
mod http_server;
mod registry;
mod relay;
mod system;
mod upload;
mod videos;

use config::{Config, OperationalMode};
use http_server::{HttpServer, Lifecycle};
use registry::Registry;
use system::{sensors, CommandRunner, SystemRunner};

/// Local control panel for a ground-station device.
#[derive(Debug, Parser)]
#[command(name = "gs-panel", version)]
struct Cli {
    /// `live` issues real systemctl, journalctl and sensor calls; `simulated`
    /// stubs them.
    #[arg(long, value_enum, default_value = "live", env = "GS_PANEL_MODE")]
    mode: OperationalMode,

    /// Settings document. Defaults depend on the mode.
    #[arg(long, env = "GS_PANEL_SETTINGS")]
    settings: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0", env = "GS_PANEL_BIND")]
    bind: IpAddr,

    /// Directory the uploaded key is stored in, as `gs.key`.
    #[arg(long, default_value = "/etc", env = "GS_PANEL_UPLOAD_DIR")]
    upload_dir: PathBuf,

    /// Device command listener that operator commands are sent to.
    #[arg(long, default_value = "127.0.0.1:14550", env = "GS_PANEL_COMMAND_TARGET")]
    command_target: std::net::SocketAddr,

    #[arg(long, default_value = sensors::SOC_SENSOR)]
    soc_sensor: PathBuf,

    #[arg(long, default_value = sensors::GPU_SENSOR)]
    gpu_sensor: PathBuf,

    /// Services shown and controlled on the panel.
    #[arg(long = "service", default_values = ["openipc", "wifibroadcast.service"])]
    services: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        let settings_path = self
            .settings
            .map(config::expand_home)
            .unwrap_or_else(|| self.mode.default_settings_path());
        Config {
            mode: self.mode,
            settings_path,
            bind_addr: self.bind,
            upload_dir: self.upload_dir,
            command_target: self.command_target,
            soc_sensor: self.soc_sensor,
            gpu_sensor: self.gpu_sensor,
            services: self.services,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config();

    let level = match config.mode {
        OperationalMode::Live => Level::INFO,
        OperationalMode::Simulated => Level::DEBUG,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting gs-panel {} in {:?} mode", config.version, config.mode);
    info!("Settings file path: {}", config.settings_path.display());

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    // Settings saves stop the server; reload the document and bind again so a
    // changed port takes effect.
    loop {
        let registry = Registry::load(&config.settings_path)
            .await
            .with_context(|| format!("loading settings from {}", config.settings_path.display()))?;

        let server = HttpServer::new(config.clone(), registry, runner.clone());
        match server.start().await.context("running HTTP server")? {
            Lifecycle::Restart => info!("Settings changed, restarting HTTP server"),
            Lifecycle::Shutdown | Lifecycle::Running => break,
        }
    }

    info!("gs-panel stopped");
    Ok(())
}
