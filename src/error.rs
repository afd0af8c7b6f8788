use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load settings: {0}")]
    ConfigLoad(String),

    #[error("Unknown config: {0}")]
    NotFound(String),

    #[error("Failed to {op} {name}: {source}")]
    File {
        name: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings: {0}")]
    ConfigSave(String),

    #[error("External command failed: {0}")]
    ExternalCommand(String),

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Upload rejected: {0}")]
    Upload(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

impl PanelError {
    pub fn file(name: impl Into<String>, op: &'static str, source: std::io::Error) -> Self {
        PanelError::File {
            name: name.into(),
            op,
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::ConfigSave(_) | PanelError::Upload(_) | PanelError::InvalidAction(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, PanelError>;
