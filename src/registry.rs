use crate::{
    config::expand_home,
    error::{PanelError, Result},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, error, info};

/// One named, path-addressed editable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub path: String,
}

/// On-disk form of the settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDocument {
    pub config_files: Vec<ConfigEntry>,
    #[serde(rename = "VIDEO_DIR")]
    pub video_dir: String,
    #[serde(rename = "SERVER_PORT")]
    pub server_port: u16,
}

/// In-memory view of the settings document. Never mutated in place: a save
/// produces a new value and the old one is dropped when the server restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    document_path: PathBuf,
    settings: SettingsDocument,
}

impl Registry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).await.map_err(|e| {
            PanelError::ConfigLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings: SettingsDocument = serde_json::from_str(&raw).map_err(|e| {
            PanelError::ConfigLoad(format!("cannot parse {}: {}", path.display(), e))
        })?;

        if settings.server_port == 0 {
            return Err(PanelError::ConfigLoad("SERVER_PORT must be 1-65535".to_string()));
        }
        if let Some(name) = duplicate_name(&settings.config_files) {
            return Err(PanelError::ConfigLoad(format!("duplicate config name: {}", name)));
        }

        info!("Loaded {} config entries from {}", settings.config_files.len(), path.display());
        debug!("Settings: {:?}", settings);

        Ok(Self {
            document_path: path.to_path_buf(),
            settings,
        })
    }

    pub fn entries(&self) -> &[ConfigEntry] {
        &self.settings.config_files
    }

    pub fn settings(&self) -> &SettingsDocument {
        &self.settings
    }

    pub fn server_port(&self) -> u16 {
        self.settings.server_port
    }

    pub fn video_dir(&self) -> PathBuf {
        expand_home(&self.settings.video_dir)
    }

    pub fn find(&self, name: &str) -> Result<&Path> {
        self.settings
            .config_files
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| Path::new(&entry.path))
            .ok_or_else(|| PanelError::NotFound(name.to_string()))
    }

    pub async fn read_file(&self, name: &str) -> Result<String> {
        let path = self.find(name)?;
        fs::read_to_string(path).await.map_err(|e| {
            error!("Failed to read config {} at {}: {}", name, path.display(), e);
            PanelError::file(name, "read", e)
        })
    }

    pub async fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.find(name)?;
        write_atomic(path, content.as_bytes()).await.map_err(|e| {
            error!("Failed to write config {} at {}: {}", name, path.display(), e);
            PanelError::file(name, "write", e)
        })?;
        debug!("Updated configuration file: {}", name);
        Ok(())
    }

    /// Copies every entry to `<path>.bak`. Stops at the first failure; backups
    /// already taken are left in place.
    pub async fn backup_all(&self) -> Result<()> {
        for entry in &self.settings.config_files {
            let backup_path = format!("{}.bak", entry.path);
            let content = fs::read(&entry.path).await.map_err(|e| {
                error!("Backup of {} failed reading {}: {}", entry.name, entry.path, e);
                PanelError::file(&entry.name, "back up", e)
            })?;
            fs::write(&backup_path, content).await.map_err(|e| {
                error!("Backup of {} failed writing {}: {}", entry.name, backup_path, e);
                PanelError::file(&entry.name, "back up", e)
            })?;
        }

        debug!("Backup created for {} configuration files", self.settings.config_files.len());
        Ok(())
    }

    /// Validates and persists a full replacement of the settings document.
    /// The returned registry only takes effect once the server restarts.
    pub async fn save(
        &self,
        entries: Vec<ConfigEntry>,
        video_dir: String,
        server_port: &str,
    ) -> Result<Registry> {
        let server_port = parse_port(server_port)?;
        if let Some(name) = duplicate_name(&entries) {
            return Err(PanelError::ConfigSave(format!("duplicate config name: {}", name)));
        }
        if let Some(entry) = entries.iter().find(|e| e.name.is_empty() || e.path.is_empty()) {
            return Err(PanelError::ConfigSave(format!(
                "config entry needs both name and path (got name {:?}, path {:?})",
                entry.name, entry.path
            )));
        }

        let settings = SettingsDocument {
            config_files: entries,
            video_dir,
            server_port,
        };
        let json = serde_json::to_string_pretty(&settings)
            .map_err(|e| PanelError::ConfigSave(e.to_string()))?;

        write_atomic(&self.document_path, json.as_bytes())
            .await
            .map_err(|e| {
                error!("Failed to write settings {}: {}", self.document_path.display(), e);
                PanelError::file(self.document_path.display().to_string(), "save", e)
            })?;

        info!("Settings saved to {}", self.document_path.display());
        Ok(Registry {
            document_path: self.document_path.clone(),
            settings,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(PanelError::ConfigSave(format!(
            "SERVER_PORT must be an integer in 1-65535, got {:?}",
            raw
        ))),
    }
}

fn duplicate_name(entries: &[ConfigEntry]) -> Option<&str> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(|entry| entry.name.as_str())
        .find(|name| !seen.insert(*name))
}

/// Replaces `path` with `contents` by writing a sibling temp file and renaming
/// it over the target. Symlinks are followed and the target keeps its
/// permissions.
pub async fn write_atomic(path: impl AsRef<Path>, contents: &[u8]) -> std::io::Result<()> {
    write_atomic_with_mode(path, contents, 0o666).await
}

/// Like [`write_atomic`]; `new_mode` applies (under the umask) only when the
/// target does not exist yet.
pub async fn write_atomic_with_mode(
    path: impl AsRef<Path>,
    contents: &[u8],
    new_mode: u32,
) -> std::io::Result<()> {
    let path = path.as_ref();
    let target = match fs::canonicalize(path).await {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == ErrorKind::NotFound => path.to_path_buf(),
        Err(e) => return Err(e),
    };
    let existing = match fs::metadata(&target).await {
        Ok(meta) => Some(meta.permissions()),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let mut tmp_name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = target.with_file_name(tmp_name);

    let result = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(new_mode)
            .open(&tmp_path)
            .await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(permissions) = existing {
            fs::set_permissions(&tmp_path, permissions).await?;
        }
        fs::rename(&tmp_path, &target).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};
    use tokio_test::{assert_err, assert_ok};

    async fn registry_with(dir: &TempDir, entries: &[(&str, &str)]) -> Registry {
        let config_files: Vec<ConfigEntry> = entries
            .iter()
            .map(|(name, file)| ConfigEntry {
                name: name.to_string(),
                path: dir.path().join(file).display().to_string(),
            })
            .collect();
        let document = SettingsDocument {
            config_files,
            video_dir: dir.path().join("videos").display().to_string(),
            server_port: 5001,
        };
        let path = dir.path().join("settings.json");
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();
        Registry::load(&path).await.unwrap()
    }

    #[tokio::test]
    async fn load_rejects_missing_document() {
        let dir = tempdir().unwrap();
        let err = Registry::load(dir.path().join("absent.json")).await.unwrap_err();
        assert!(matches!(err, PanelError::ConfigLoad(_)));
    }

    #[tokio::test]
    async fn load_rejects_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"config_files": [], "VIDEO_DIR": "/tmp"}"#).unwrap();
        let err = Registry::load(&path).await.unwrap_err();
        assert!(matches!(err, PanelError::ConfigLoad(_)));
    }

    #[tokio::test]
    async fn load_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"config_files": [{"name": "a", "path": "/x"}, {"name": "a", "path": "/y"}],
                "VIDEO_DIR": "/tmp", "SERVER_PORT": 5001}"#,
        )
        .unwrap();
        assert_err!(Registry::load(&path).await);
    }

    #[tokio::test]
    async fn find_resolves_known_names_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"config_files": [{"name": "a", "path": "/x"}, {"name": "b", "path": "/y"}],
                "VIDEO_DIR": "/tmp", "SERVER_PORT": 5001}"#,
        )
        .unwrap();
        let registry = Registry::load(&path).await.unwrap();

        assert_eq!(registry.find("a").unwrap(), Path::new("/x"));
        assert!(matches!(registry.find("c"), Err(PanelError::NotFound(name)) if name == "c"));
    }

    #[tokio::test]
    async fn write_then_read_returns_exact_content() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("wfb", "wfb.conf")]).await;
        let content = "channel=161\n\n# trailing spaces   \nbandwidth=20";

        assert_ok!(registry.write_file("wfb", content).await);
        assert_eq!(registry.read_file("wfb").await.unwrap(), content);
        assert!(!dir.path().join("wfb.conf.tmp").exists());
    }

    #[tokio::test]
    async fn write_keeps_target_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("wfb", "wfb.conf")]).await;
        let path = dir.path().join("wfb.conf");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        assert_ok!(registry.write_file("wfb", "new").await);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[tokio::test]
    async fn write_through_symlink_updates_real_file() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("wfb", "wfb-link.conf")]).await;
        let real = dir.path().join("wfb.conf");
        let link = dir.path().join("wfb-link.conf");
        std::fs::write(&real, "old").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert_ok!(registry.write_file("wfb", "via-link").await);

        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_to_string(&real).unwrap(), "via-link");
        assert_eq!(registry.read_file("wfb").await.unwrap(), "via-link");
    }

    #[tokio::test]
    async fn read_of_unknown_name_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("wfb", "wfb.conf")]).await;
        assert!(matches!(
            registry.read_file("majestic").await,
            Err(PanelError::NotFound(_))
        ));
        assert!(matches!(
            registry.write_file("majestic", "x").await,
            Err(PanelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_of_missing_file_is_file_error() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("wfb", "wfb.conf")]).await;
        let err = registry.read_file("wfb").await.unwrap_err();
        assert!(matches!(err, PanelError::File { ref name, op: "read", .. } if name == "wfb"));
    }

    #[tokio::test]
    async fn backup_stops_at_failing_entry() {
        let dir = tempdir().unwrap();
        let registry = registry_with(
            &dir,
            &[("one", "one.conf"), ("two", "two.conf"), ("three", "three.conf"), ("four", "four.conf")],
        )
        .await;
        std::fs::write(dir.path().join("one.conf"), "1").unwrap();
        std::fs::write(dir.path().join("two.conf"), "2").unwrap();
        std::fs::write(dir.path().join("two.conf.bak"), "stale").unwrap();
        std::fs::write(dir.path().join("four.conf"), "4").unwrap();

        let err = registry.backup_all().await.unwrap_err();

        assert!(matches!(err, PanelError::File { ref name, .. } if name == "three"));
        assert_eq!(std::fs::read_to_string(dir.path().join("one.conf.bak")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(dir.path().join("two.conf.bak")).unwrap(), "2");
        assert!(!dir.path().join("four.conf.bak").exists());
    }

    #[tokio::test]
    async fn backup_copies_every_entry() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("a", "a.conf"), ("b", "b.conf")]).await;
        std::fs::write(dir.path().join("a.conf"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.conf"), "beta").unwrap();

        assert_ok!(registry.backup_all().await);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.conf.bak")).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.conf.bak")).unwrap(), "beta");
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("a", "a.conf")]).await;
        let entries = vec![
            ConfigEntry { name: "wfb".into(), path: "/etc/wifibroadcast.cfg".into() },
            ConfigEntry { name: "majestic".into(), path: "/etc/majestic.yaml".into() },
        ];

        let saved = registry
            .save(entries.clone(), "/media/videos".into(), " 8080 ")
            .await
            .unwrap();
        let reloaded = Registry::load(dir.path().join("settings.json")).await.unwrap();

        assert_eq!(saved, reloaded);
        assert_eq!(reloaded.entries(), entries.as_slice());
        assert_eq!(reloaded.settings().video_dir, "/media/videos");
        assert_eq!(reloaded.server_port(), 8080);
    }

    #[tokio::test]
    async fn save_with_bad_port_leaves_document_untouched() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("a", "a.conf")]).await;
        let before = std::fs::read(dir.path().join("settings.json")).unwrap();

        for port in ["eighty", "", "0", "70000", "80.5"] {
            let err = registry.save(vec![], "/videos".into(), port).await.unwrap_err();
            assert!(matches!(err, PanelError::ConfigSave(_)), "port {:?}", port);
        }

        assert_eq!(std::fs::read(dir.path().join("settings.json")).unwrap(), before);
    }

    #[tokio::test]
    async fn save_rejects_duplicate_names() {
        let dir = tempdir().unwrap();
        let registry = registry_with(&dir, &[("a", "a.conf")]).await;
        let entries = vec![
            ConfigEntry { name: "a".into(), path: "/x".into() },
            ConfigEntry { name: "a".into(), path: "/y".into() },
        ];
        assert!(matches!(
            registry.save(entries, "/videos".into(), "5001").await,
            Err(PanelError::ConfigSave(_))
        ));
    }
}
