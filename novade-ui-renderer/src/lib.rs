//! Vulkan frame and resource coordinator for the NovaDE immediate-mode UI.
//!
//! The UI layout engine hands a [`Scene`] of instanced draw records plus any
//! atlas changes ([`PendingUploads`]) to [`FrameCoordinator::render`] once per
//! frame. The coordinator keeps [`FRAMES_IN_FLIGHT`] frames in flight, each
//! with its own instance buffers, uniforms, descriptor sets, staging lane and
//! synchronization primitives.
//!
//! ```no_run
//! # fn run<W>(window: &W) -> Result<(), novade_ui_renderer::RendererError>
//! # where W: raw_window_handle::HasRawDisplayHandle + raw_window_handle::HasRawWindowHandle {
//! use novade_ui_renderer::{FrameCoordinator, PendingUploads, RendererConfig, Scene, ShaderSet};
//!
//! let shaders = ShaderSet::load_dir(std::path::Path::new("shaders"))?;
//! let config = RendererConfig::default();
//! let mut renderer = FrameCoordinator::init(window, 1280, 720, 1.0, &config, &shaders)?;
//! let mut uploads = PendingUploads::new();
//! renderer.render(&Scene::default(), &mut uploads)?;
//! renderer.deinit();
//! # Ok(())
//! # }
//! ```

pub mod atlas;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod scene;
pub mod shader;
pub mod surface;
pub mod sync;
pub mod types;

/// Number of frame slots. Frame `k` uses slot `k % FRAMES_IN_FLIGHT`.
pub const FRAMES_IN_FLIGHT: usize = 3;

pub use atlas::{AtlasKind, DirtyRect, PendingUploads};
pub use config::RendererConfig;
pub use device::GpuContext;
pub use error::{ConfigError, InitError, RendererError, Result, Subsystem};
pub use frame::{FrameCoordinator, FrameStats, FrameStatus};
pub use scene::{Color, DrawKind, GlyphQuad, IconQuad, ImageQuad, Quad, Rect, Scene, UvRect};
pub use shader::{ShaderPair, ShaderSet};
