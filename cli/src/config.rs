//! Pipeline configuration loading.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use posecast_ipc::{Compression, PipelineConfig};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub target_hz: Option<u32>,
    pub skip_frames: Option<u32>,
    pub compress: bool,
}

/// Load a configuration file, falling back to defaults when no path is given.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    if let Some(hz) = overrides.target_hz {
        config.target_hz = hz;
    }
    if let Some(skip) = overrides.skip_frames {
        config.skip_frames = skip;
    }
    if overrides.compress {
        config.compression = Compression::On;
    }

    config.validate().context("Configuration rejected")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecast_ipc::ChannelKind;

    #[test]
    fn test_defaults_without_file() {
        let config = load(None, &Overrides::default()).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_file_then_overrides() {
        let path = std::env::temp_dir().join(format!("posecast-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"channel":"group","target_hz":60}"#).unwrap();

        let overrides = Overrides {
            skip_frames: Some(2),
            compress: true,
            ..Default::default()
        };
        let config = load(Some(&path), &overrides).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.channel, ChannelKind::Group);
        assert_eq!(config.target_hz, 60);
        assert_eq!(config.skip_frames, 2);
        assert!(config.compression.is_enabled());
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let overrides = Overrides {
            skip_frames: Some(0),
            ..Default::default()
        };
        assert!(load(None, &overrides).is_err());
    }
}
