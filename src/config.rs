// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default matching the stock reproduction (640x480 window,
// explicit semaphores, validation on), so the program runs without a file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "RenderDoc Bug".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Frame synchronization settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Order acquire -> submit -> present with semaphores.
    /// `false` reproduces the unsynchronized pattern that triggers the bug.
    pub explicit_semaphores: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            explicit_semaphores: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    /// Close the window after this many presented frames
    pub max_frames: Option<u64>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            max_frames: None,
        }
    }
}

/// How loading went. Loading runs before the logger is installed, so this is
/// handed back to `main` and reported once logging is up.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid(anyhow::Error),
}

impl LoadOutcome {
    pub fn log(&self) {
        match self {
            LoadOutcome::Loaded(path) => log::info!("Loaded configuration from {:?}", path),
            LoadOutcome::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            LoadOutcome::Invalid(e) => log::warn!("{:#}. Using defaults.", e),
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults if missing or invalid
    pub fn load() -> (Self, LoadOutcome) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, LoadOutcome) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(Some(config)) => (config, LoadOutcome::Loaded(path.to_path_buf())),
            Ok(None) => (Config::default(), LoadOutcome::Missing(path.to_path_buf())),
            Err(e) => (Config::default(), LoadOutcome::Invalid(e)),
        }
    }

    /// Load configuration from a specific path. `None` when there is no file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Log level filter, `Info` for anything unrecognised
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_reproduction() {
        let config = Config::default();
        assert_eq!(config.window.title, "RenderDoc Bug");
        assert_eq!((config.window.width, config.window.height), (640, 480));
        assert!(config.sync.explicit_semaphores);
        assert!(config.debug.validation_layers);
        assert_eq!(config.debug.max_frames, None);
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config = Config::parse(
            r#"
            [sync]
            explicit_semaphores = false

            [debug]
            max_frames = 3
            log_level = "trace"
            "#,
        )
        .unwrap();

        assert!(!config.sync.explicit_semaphores);
        assert_eq!(config.debug.max_frames, Some(3));
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
        assert!(config.debug.validation_layers);
        assert_eq!(config.window.width, 640);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config::parse("[debug]\nlog_level = \"loud\"\n").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window]\nwidth = \"wide\"\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        assert!(Config::load_from_path("definitely/not/here/config.toml")
            .unwrap()
            .is_none());

        let (config, outcome) = Config::load_or_default("definitely/not/here/config.toml");
        assert_eq!(config.window.height, 480);
        assert!(matches!(outcome, LoadOutcome::Missing(_)));
    }

    #[test]
    fn invalid_file_hands_back_the_error_with_defaults() {
        let dir = std::env::temp_dir().join(format!("renderdoc-bug-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[window]\nwidth = \"wide\"\n").unwrap();

        let (config, outcome) = Config::load_or_default(&path);

        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(config.window.width, 640);
        match outcome {
            LoadOutcome::Invalid(e) => {
                assert!(format!("{:#}", e).contains("Failed to parse config file"))
            }
            other => panic!("expected an invalid config, got {:?}", other),
        }
    }
}
