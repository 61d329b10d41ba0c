//! Renderer configuration.
//!
//! [`RendererConfig`] is deserialized from TOML. Every field has a default, so
//! an empty document (or a missing file) yields a working configuration.
//! Unknown keys are rejected via `#[serde(deny_unknown_fields)]`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

mod defaults {
    use std::path::PathBuf;

    pub fn application_name() -> String {
        "novade-ui".to_string()
    }

    pub fn enable_validation() -> bool {
        false
    }

    pub fn max_msaa_samples() -> u32 {
        4
    }

    pub fn prefer_mailbox() -> bool {
        true
    }

    pub fn clear_color() -> [f32; 4] {
        [0.0, 0.0, 0.0, 0.0]
    }

    pub fn staging_lane_bytes() -> u64 {
        16 * 1024 * 1024
    }

    pub fn pipeline_cache_path() -> Option<PathBuf> {
        None
    }
}

/// Tunables for [`crate::FrameCoordinator`].
///
/// ```
/// use novade_ui_renderer::config::RendererConfig;
///
/// let config = RendererConfig::from_toml_str(r#"
/// max_msaa_samples = 2
/// pipeline_cache_path = "/tmp/novade-ui.cache"
/// "#).unwrap();
/// assert_eq!(config.max_msaa_samples, 2);
/// assert!(config.prefer_mailbox);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendererConfig {
    /// Application name reported to the Vulkan driver.
    #[serde(default = "defaults::application_name")]
    pub application_name: String,
    /// Enables `VK_LAYER_KHRONOS_validation` and routes its messages to `tracing`.
    #[serde(default = "defaults::enable_validation")]
    pub enable_validation: bool,
    /// Upper bound for the MSAA sample count (1, 2 or 4).
    #[serde(default = "defaults::max_msaa_samples")]
    pub max_msaa_samples: u32,
    /// Prefer MAILBOX presentation over FIFO when the surface offers it.
    #[serde(default = "defaults::prefer_mailbox")]
    pub prefer_mailbox: bool,
    #[serde(default = "defaults::clear_color")]
    pub clear_color: [f32; 4],
    /// Bytes reserved per frame slot for atlas uploads.
    #[serde(default = "defaults::staging_lane_bytes")]
    pub staging_lane_bytes: u64,
    /// Location of the persisted pipeline-cache blob. `None` disables persistence.
    #[serde(default = "defaults::pipeline_cache_path")]
    pub pipeline_cache_path: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: defaults::application_name(),
            enable_validation: defaults::enable_validation(),
            max_msaa_samples: defaults::max_msaa_samples(),
            prefer_mailbox: defaults::prefer_mailbox(),
            clear_color: defaults::clear_color(),
            staging_lane_bytes: defaults::staging_lane_bytes(),
            pipeline_cache_path: defaults::pipeline_cache_path(),
        }
    }
}

impl RendererConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RendererConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::from_toml_str(&source),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Renderer config {:?} not found, using defaults.", path);
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.max_msaa_samples, 1 | 2 | 4) {
            return Err(ConfigError::Validation {
                field: "max_msaa_samples",
                reason: format!("expected 1, 2 or 4, got {}", self.max_msaa_samples),
            });
        }
        if self.staging_lane_bytes == 0 || self.staging_lane_bytes % 16 != 0 {
            return Err(ConfigError::Validation {
                field: "staging_lane_bytes",
                reason: format!(
                    "must be a non-zero multiple of 16, got {}",
                    self.staging_lane_bytes
                ),
            });
        }
        if self.clear_color.iter().any(|c| !c.is_finite()) {
            return Err(ConfigError::Validation {
                field: "clear_color",
                reason: "components must be finite".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RendererConfig::from_toml_str("").unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = RendererConfig::from_toml_str(
            r#"
            application_name = "panel"
            enable_validation = true
            clear_color = [0.1, 0.2, 0.3, 1.0]
            staging_lane_bytes = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.application_name, "panel");
        assert!(config.enable_validation);
        assert_eq!(config.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(config.staging_lane_bytes, 1 << 20);
        assert_eq!(config.max_msaa_samples, 4);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RendererConfig::from_toml_str("frames_in_flight = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_sample_count_fails_validation() {
        let err = RendererConfig::from_toml_str("max_msaa_samples = 8").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation {
                field: "max_msaa_samples",
                ..
            }
        ));
    }

    #[test]
    fn unaligned_lane_size_fails_validation() {
        let err = RendererConfig::from_toml_str("staging_lane_bytes = 1000").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation {
                field: "staging_lane_bytes",
                ..
            }
        ));
    }

    #[test]
    fn load_reads_file_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert_eq!(RendererConfig::load(&missing).unwrap(), RendererConfig::default());

        let path = dir.path().join("renderer.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "prefer_mailbox = false").unwrap();
        let config = RendererConfig::load(&path).unwrap();
        assert!(!config.prefer_mailbox);
    }
}
