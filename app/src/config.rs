use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SETTINGS_FILE: &str = "cli_settings.json";

/// Preferences of the terminal front-end, kept apart from `jugaad.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliSettings {
    #[serde(default = "CliSettings::default_stream")]
    pub stream: bool,
    #[serde(default = "CliSettings::default_show_metadata")]
    pub show_metadata: bool,
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            stream: CliSettings::default_stream(),
            show_metadata: CliSettings::default_show_metadata(),
            location: None,
        }
    }
}

impl CliSettings {
    fn default_stream() -> bool {
        true
    }

    fn default_show_metadata() -> bool {
        true
    }
}

pub async fn load_cli_settings(path: &Path) -> Result<CliSettings> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                let defaults = CliSettings::default();
                save_cli_settings(path, &defaults).await?;
                warn!(
                    error = ?err,
                    "failed to parse {SETTINGS_FILE}, resetting to defaults"
                );
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let defaults = CliSettings::default();
            save_cli_settings(path, &defaults).await?;
            Ok(defaults)
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub async fn save_cli_settings(path: &Path, settings: &CliSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write {SETTINGS_FILE} at {}", path.display()))
}

pub fn cli_settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE)
}

fn config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("jugaad")
    } else {
        PathBuf::from(".jugaad")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = load_cli_settings(&path).await.expect("load");
        assert_eq!(settings, CliSettings::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_resets_to_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE);
        tokio::fs::write(&path, "{ nope").await.expect("write");
        let settings = load_cli_settings(&path).await.expect("load");
        assert_eq!(settings, CliSettings::default());
    }

    #[tokio::test]
    async fn saved_settings_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE);
        let settings = CliSettings {
            stream: false,
            show_metadata: false,
            location: Some("Bengaluru".into()),
        };
        save_cli_settings(&path, &settings).await.expect("save");
        assert_eq!(load_cli_settings(&path).await.expect("load"), settings);

        tokio::fs::write(&path, r#"{"location":"Pune"}"#)
            .await
            .expect("write");
        let partial = load_cli_settings(&path).await.expect("load");
        assert!(partial.stream);
        assert_eq!(partial.location.as_deref(), Some("Pune"));
    }
}
