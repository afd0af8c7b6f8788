use crate::{
    error::{PanelError, Result},
    registry::write_atomic_with_mode,
};
use std::path::PathBuf;
use tracing::{error, info};

pub const ALLOWED_EXTENSION: &str = "key";

/// A freshly created key is readable by its owner only.
const KEY_MODE: u32 = 0o600;

/// Destination for the ground-station key. Every accepted upload replaces
/// the same file.
#[derive(Debug, Clone)]
pub struct KeyStore {
    destination: PathBuf,
}

impl KeyStore {
    pub fn new(destination: PathBuf) -> Self {
        Self { destination }
    }

    pub fn accepts(filename: &str) -> bool {
        filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.eq_ignore_ascii_case(ALLOWED_EXTENSION))
            .unwrap_or(false)
    }

    pub async fn store(&self, filename: Option<&str>, data: &[u8]) -> Result<()> {
        let filename = match filename {
            Some(name) if !name.is_empty() => name,
            _ => return Err(PanelError::Upload("No selected file".to_string())),
        };
        if !Self::accepts(filename) {
            return Err(PanelError::Upload(format!(
                "{} is not a .{} file",
                filename, ALLOWED_EXTENSION
            )));
        }

        write_atomic_with_mode(&self.destination, data, KEY_MODE).await.map_err(|e| {
            error!("Failed to store key {} at {}: {}", filename, self.destination.display(), e);
            PanelError::file(filename, "upload", e)
        })?;
        info!("Stored uploaded key {} at {}", filename, self.destination.display());
        Ok(())
    }
}
