use crate::error::{PanelError, Result};
use std::path::Path;
use tokio::fs;
use tracing::{debug, error};

pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "mkv", "avi"];

fn is_video(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Recording names in `dir`, in directory order.
pub async fn list_videos(dir: &Path) -> Result<Vec<String>> {
    let mut entries = fs::read_dir(dir).await.map_err(|e| {
        error!("Failed to list videos in {}: {}", dir.display(), e);
        PanelError::file(dir.display().to_string(), "list", e)
    })?;

    let mut videos = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PanelError::file(dir.display().to_string(), "list", e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            if is_video(name) {
                videos.push(name.to_string());
            }
        }
    }

    debug!("Video files found in {}: {:?}", dir.display(), videos);
    Ok(videos)
}
