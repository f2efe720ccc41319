use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use scanner::ScannerConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub music_root: String,
    pub index_path: String,
    pub port: u16,
    pub watch_music: bool,
    pub watch_debounce_secs: u64,
    pub scan_on_startup: bool,
    pub scanner: ScannerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            index_path: "library.redb".to_string(),
            port: 3000,
            watch_music: true,
            watch_debounce_secs: 2,
            scan_on_startup: true,
            scanner: ScannerConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("SHELF_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "library.redb".to_string();
        }
        if config.port == 0 {
            config.port = 3000;
        }
        if config.watch_debounce_secs == 0 {
            config.watch_debounce_secs = 2;
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::{load_or_create_config, resolve_music_root, resolve_path, ServerConfig};
    use std::fs;
    use std::path::Path;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.scanner.files_batch_size, 100);

        let (_, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
    }

    #[test]
    fn partial_config_keeps_scanner_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "music_root: music\nport: 0\nscanner:\n  external: true\n  genre_separators: \";\"\n",
        )
        .unwrap();
        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.port, 3000);
        assert!(config.scanner.external);
        assert_eq!(config.scanner.genre_separators, ";");
        assert_eq!(config.scanner.status_update_interval_ms, 2000);
        assert!(!config.scanner.group_album_releases);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let config_path = Path::new("/srv/shelf/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            Path::new("/srv/shelf/library.redb")
        );
        assert_eq!(resolve_path(config_path, "/data/x.redb"), Path::new("/data/x.redb"));
        assert!(resolve_music_root(config_path, "  ").is_none());
        assert_eq!(ServerConfig::default().index_path, "library.redb");
    }
}
