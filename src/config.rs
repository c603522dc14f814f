// Configuration - renderer settings from config.toml
//
// Missing files or sections fall back to defaults so the renderer always
// has a usable configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub renderer: RendererSettings,
    pub debug: DebugConfig,
}

/// Renderer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Ring size: how many frames the CPU may run ahead of the GPU
    pub max_frames_in_flight: usize,
    pub msaa_enabled: bool,
    pub anisotropy_enabled: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            msaa_enabled: true,
            anisotropy_enabled: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

impl Config {
    /// Load configuration from `config.toml`, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.renderer.max_frames_in_flight, 2);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [renderer]
            max_frames_in_flight = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.renderer.max_frames_in_flight, 3);
        // Unspecified fields keep their defaults
        assert!(config.renderer.msaa_enabled);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn parses_full_toml() {
        let config: Config = toml::from_str(
            r#"
            [renderer]
            max_frames_in_flight = 1
            msaa_enabled = false
            anisotropy_enabled = false

            [debug]
            validation_layers = false
            "#,
        )
        .unwrap();
        assert_eq!(config.renderer.max_frames_in_flight, 1);
        assert!(!config.renderer.msaa_enabled);
        assert!(!config.debug.validation_layers);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("definitely/not/a/config.toml").unwrap();
        assert_eq!(config.renderer.max_frames_in_flight, 2);
    }
}
