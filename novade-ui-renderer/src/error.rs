//! Error types for the UI renderer.
//!
//! Setup failures are surfaced as [`RendererError`] values tagged with the
//! [`Subsystem`] that produced them. Capacity violations (pool exhaustion,
//! too many queued atlas transfers) are not represented here: they are static
//! sizing defects and are asserted where they occur.

use ash::vk;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::scene::DrawKind;

/// A specialized `Result` type for renderer operations.
pub type Result<T> = std::result::Result<T, RendererError>;

/// Error returned by [`crate::FrameCoordinator::init`].
pub type InitError = RendererError;

/// The component of the renderer that reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    DeviceBootstrap,
    PresentationSurface,
    MemoryPool,
    DescriptorManager,
    PipelineFactory,
    AtlasStreaming,
    FrameCoordinator,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::DeviceBootstrap => "device bootstrap",
            Subsystem::PresentationSurface => "presentation surface",
            Subsystem::MemoryPool => "memory pool",
            Subsystem::DescriptorManager => "descriptor manager",
            Subsystem::PipelineFactory => "pipeline factory",
            Subsystem::AtlasStreaming => "atlas streaming",
            Subsystem::FrameCoordinator => "frame coordinator",
        };
        f.write_str(name)
    }
}

/// Shader stage named in [`RendererError::InvalidShader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RendererError {
    /// The Vulkan loader library could not be found or opened.
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(#[from] ash::LoadingError),

    /// A Vulkan call returned an error code.
    #[error("{subsystem}: {operation} failed: {result}")]
    Vulkan {
        subsystem: Subsystem,
        operation: &'static str,
        #[source]
        result: vk::Result,
    },

    #[error("device bootstrap: no physical device offers swapchain support and a graphics queue")]
    NoSuitableDevice,

    #[error("device bootstrap: no queue family supports both graphics and presentation")]
    NoSuitableQueueFamily,

    #[error("presentation surface: surface advertises no formats")]
    NoSurfaceFormat,

    #[error("{subsystem}: no memory type offers {required:?}")]
    NoSuitableMemoryType {
        subsystem: Subsystem,
        required: vk::MemoryPropertyFlags,
    },

    #[error("pipeline factory: {stage} shader for {kind:?} rejected: {reason}")]
    InvalidShader {
        kind: DrawKind,
        stage: ShaderStage,
        reason: String,
    },

    #[error("pipeline factory: failed to read shader {path:?}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),

    /// An earlier frame failed after its fence was reset or its image was
    /// acquired. The coordinator must be re-initialised.
    #[error("frame coordinator: unusable after an earlier failure")]
    CoordinatorLost,
}

impl RendererError {
    /// True for errors the device cannot recover from without re-initialisation.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            RendererError::Vulkan {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        )
    }
}

/// Errors raised while loading or validating a [`crate::config::RendererConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },
}

/// Attaches subsystem context to raw `vk::Result` errors.
pub(crate) trait VkResultExt<T> {
    fn in_subsystem(self, subsystem: Subsystem, operation: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn in_subsystem(self, subsystem: Subsystem, operation: &'static str) -> Result<T> {
        self.map_err(|result| RendererError::Vulkan {
            subsystem,
            operation,
            result,
        })
    }
}
