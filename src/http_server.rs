use crate::{
    config::Config,
    error::{PanelError, Result},
    registry::{ConfigEntry, Registry, SettingsDocument},
    relay::LogRelay,
    system::{
        device::DeviceChannel,
        sensors::ThermalSensors,
        services::{ServiceAction, ServiceManager},
        CommandRunner,
    },
    upload::KeyStore,
    videos,
};
use bytes::{BufMut, Bytes};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::Infallible, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info};
use warp::{
    http::header,
    hyper::Body,
    multipart::{FormData, Part},
    reply::Response,
    Filter, Reply,
};

const MAX_UPLOAD_BYTES: u64 = 64 * 1024;

/// Why a server instance stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// Settings were saved; the supervisor should reload and rebind.
    Restart,
    Shutdown,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    services: ServiceManager,
    sensors: ThermalSensors,
    relay: LogRelay,
    device: DeviceChannel,
    keys: KeyStore,
    version: String,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

pub struct HttpServer {
    config: Config,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: Config, registry: Registry, runner: Arc<dyn CommandRunner>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        let state = AppState {
            registry: Arc::new(registry),
            services: ServiceManager::new(config.mode, runner.clone(), config.services.clone()),
            sensors: ThermalSensors::new(config.mode, config.soc_sensor.clone(), config.gpu_sensor.clone()),
            relay: LogRelay::new(config.mode, runner),
            device: DeviceChannel::new(config.command_target),
            keys: KeyStore::new(config.key_path()),
            version: config.version.clone(),
            lifecycle: Arc::new(lifecycle),
        };
        Self { config, state }
    }

    /// Serves until settings are saved or the process is interrupted.
    pub async fn start(&self) -> Result<Lifecycle> {
        let addr = self.config.listen_addr(self.state.registry.server_port());
        let routes = self.create_routes();

        let lifecycle = self.state.lifecycle.clone();
        let mut changes = lifecycle.subscribe();
        let shutdown = async move {
            tokio::select! {
                _ = changes.changed() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    lifecycle.send_replace(Lifecycle::Shutdown);
                }
            }
        };

        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| {
                PanelError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot bind {}: {}", addr, e),
                ))
            })?;

        info!("HTTP server listening on {}", bound);
        server.await;

        let exit = *self.state.lifecycle.borrow();
        info!("HTTP server on {} stopped ({:?})", bound, exit);
        Ok(exit)
    }

    fn create_routes(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let state = self.state.clone();
        let with_state = warp::any().map(move || state.clone());

        let index = warp::path::end()
            .and(warp::get())
            .map(|| warp::reply::html(include_str!("../static/index.html")));

        let status = warp::path!("api" / "status")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(status);

        let read_config = warp::path!("api" / "configs" / String)
            .and(warp::get())
            .and(with_state.clone())
            .and_then(read_config);

        let write_config = warp::path!("api" / "configs" / String)
            .and(warp::post())
            .and(warp::body::json())
            .and(with_state.clone())
            .and_then(write_config);

        let backup = warp::path!("backup")
            .and(warp::post())
            .and(with_state.clone())
            .and_then(backup);

        let list_videos = warp::path!("api" / "videos")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(list_videos);

        let play = warp::path("play").and(warp::fs::dir(self.state.registry.video_dir()));

        let temperature = warp::path!("temperature")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(temperature);

        let run_command = warp::path!("run_command")
            .and(warp::post())
            .and(warp::body::form())
            .and(with_state.clone())
            .and_then(run_command);

        let service_action = warp::path!("service_action")
            .and(warp::post())
            .and(warp::body::form())
            .and(with_state.clone())
            .and_then(service_action);

        let upload = warp::path!("upload")
            .and(warp::post())
            .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
            .and(with_state.clone())
            .and_then(upload);

        let read_settings = warp::path!("settings")
            .and(warp::get())
            .and(with_state.clone())
            .and_then(read_settings);

        let save_settings = warp::path!("settings")
            .and(warp::post())
            .and(warp::body::json())
            .and(with_state.clone())
            .and_then(save_settings);

        let stream = warp::path!("stream")
            .and(warp::get())
            .and(with_state)
            .and_then(stream);

        index
            .or(status)
            .or(read_config)
            .or(write_config)
            .or(backup)
            .or(list_videos)
            .or(play)
            .or(temperature)
            .or(run_command)
            .or(service_action)
            .or(upload)
            .or(read_settings)
            .or(save_settings)
            .or(stream)
            .with(warp::trace::request())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct Flash {
    level: &'static str,
    message: String,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    version: &'a str,
    config_files: Vec<&'a str>,
    services: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ConfigContent {
    #[serde(default)]
    name: String,
    content: String,
}

#[derive(Deserialize)]
struct CommandForm {
    command: String,
}

#[derive(Deserialize)]
struct ServiceForm {
    service_name: String,
    action: String,
}

/// Accepts the port either as a JSON number or as the operator's raw text.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(serde_json::Number),
    Text(String),
}

impl PortField {
    fn as_text(&self) -> String {
        match self {
            PortField::Number(n) => n.to_string(),
            PortField::Text(s) => s.clone(),
        }
    }
}

#[derive(Deserialize)]
struct SettingsUpdate {
    config_files: Vec<ConfigEntry>,
    #[serde(rename = "VIDEO_DIR")]
    video_dir: String,
    #[serde(rename = "SERVER_PORT")]
    server_port: PortField,
}

fn error_reply(err: &PanelError) -> Response {
    let body = warp::reply::json(&ErrorBody {
        error: err.to_string(),
    });
    warp::reply::with_status(body, err.status_code()).into_response()
}

fn flash(level: &'static str, message: impl Into<String>) -> Response {
    warp::reply::json(&Flash {
        level,
        message: message.into(),
    })
    .into_response()
}

fn json_or_error<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => error_reply(&e),
    }
}

async fn status(state: AppState) -> std::result::Result<Response, Infallible> {
    let services = match state.services.statuses().await {
        Ok(services) => services,
        Err(e) => return Ok(error_reply(&e)),
    };
    let body = StatusBody {
        version: &state.version,
        config_files: state.registry.entries().iter().map(|e| e.name.as_str()).collect(),
        services,
    };
    Ok(warp::reply::json(&body).into_response())
}

async fn read_config(name: String, state: AppState) -> std::result::Result<Response, Infallible> {
    let result = state
        .registry
        .read_file(&name)
        .await
        .map(|content| ConfigContent { name, content });
    Ok(json_or_error(result))
}

async fn write_config(
    name: String,
    body: ConfigContent,
    state: AppState,
) -> std::result::Result<Response, Infallible> {
    Ok(match state.registry.write_file(&name, &body.content).await {
        Ok(()) => flash("success", format!("Saved configuration file: {}", name)),
        Err(e) => error_reply(&e),
    })
}

async fn backup(state: AppState) -> std::result::Result<Response, Infallible> {
    Ok(match state.registry.backup_all().await {
        Ok(()) => flash("success", "Backup created for configuration files"),
        Err(e) => error_reply(&e),
    })
}

async fn list_videos(state: AppState) -> std::result::Result<Response, Infallible> {
    let dir = state.registry.video_dir();
    debug!("Loading videos from {}", dir.display());
    Ok(json_or_error(videos::list_videos(&dir).await))
}

async fn temperature(state: AppState) -> std::result::Result<Response, Infallible> {
    Ok(json_or_error(state.sensors.read().await))
}

async fn run_command(form: CommandForm, state: AppState) -> std::result::Result<Response, Infallible> {
    Ok(match state.device.send_command(&form.command).await {
        Ok(sent) => flash("info", format!("Running command: {}", sent)),
        Err(e) => error_reply(&e),
    })
}

async fn service_action(form: ServiceForm, state: AppState) -> std::result::Result<Response, Infallible> {
    let action = match form.action.parse::<ServiceAction>() {
        Ok(action) => action,
        Err(e) => return Ok(error_reply(&e)),
    };
    Ok(match state.services.apply(&form.service_name, action).await {
        Ok(()) => flash(
            "success",
            format!("Service {} {} successfully.", form.service_name, action.past_tense()),
        ),
        Err(e) => error_reply(&e),
    })
}

async fn read_part(part: Part) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunks = Box::pin(part.stream());
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| PanelError::Upload(e.to_string()))?;
        data.put(chunk);
    }
    Ok(data)
}

async fn store_upload(form: FormData, keys: &KeyStore) -> Result<()> {
    let mut form = Box::pin(form);
    while let Some(part) = form.next().await {
        let part = part.map_err(|e| PanelError::Upload(e.to_string()))?;
        if part.name() != "file" {
            continue;
        }
        let filename = part.filename().map(str::to_string);
        let data = read_part(part).await?;
        return keys.store(filename.as_deref(), &data).await;
    }
    Err(PanelError::Upload("No file part".to_string()))
}

async fn upload(form: FormData, state: AppState) -> std::result::Result<Response, Infallible> {
    Ok(match store_upload(form, &state.keys).await {
        Ok(()) => flash("success", "File successfully uploaded"),
        Err(e) => {
            error!("Key upload failed: {}", e);
            error_reply(&e)
        }
    })
}

async fn read_settings(state: AppState) -> std::result::Result<Response, Infallible> {
    let settings: &SettingsDocument = state.registry.settings();
    Ok(warp::reply::json(settings).into_response())
}

async fn save_settings(update: SettingsUpdate, state: AppState) -> std::result::Result<Response, Infallible> {
    let port = update.server_port.as_text();
    match state
        .registry
        .save(update.config_files, update.video_dir, &port)
        .await
    {
        Ok(saved) => {
            info!("Settings saved; restarting on port {}", saved.server_port());
            state.lifecycle.send_replace(Lifecycle::Restart);
            Ok(flash("success", "Settings saved, restarting"))
        }
        Err(e) => {
            error!("Rejected settings update: {}", e);
            Ok(error_reply(&e))
        }
    }
}

async fn stream(state: AppState) -> std::result::Result<Response, Infallible> {
    let events = match state.relay.open() {
        Ok(events) => events,
        Err(e) => return Ok(error_reply(&e)),
    };

    // End the response when the server restarts so graceful shutdown can finish.
    let mut changes = state.lifecycle.subscribe();
    let stopped = async move {
        let _ = changes.changed().await;
    };
    let body = events
        .take_until(stopped)
        .map(Ok::<Bytes, Infallible>);

    let mut response = Response::new(Body::wrap_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    Ok(response)
}
