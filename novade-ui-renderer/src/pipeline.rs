//! Pipeline factory, shared pipeline layouts and the persistent pipeline cache.
//!
//! Every pipeline draws instanced quads: no vertex input, six vertices per
//! instance generated in the vertex stage, triangle list, no culling, and
//! dynamic viewport/scissor. Only the shader pair, layout and blend mode
//! differ between the four draw kinds.

use anyhow::Context;
use ash::vk;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::descriptors::DescriptorManager;
use crate::error::{Result, ShaderStage, Subsystem, VkResultExt};
use crate::scene::DrawKind;
use crate::shader::{ShaderModule, ShaderPair, ShaderSet};

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Vertices emitted per instance (two triangles).
pub const VERTICES_PER_INSTANCE: u32 = 6;

/// How fragment output is composited onto the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Straight-alpha source-over.
    Standard,
    /// Source-over for shaders that output premultiplied color.
    Premultiplied,
}

impl BlendMode {
    pub fn for_kind(kind: DrawKind) -> Self {
        match kind {
            DrawKind::Vector => BlendMode::Premultiplied,
            _ => BlendMode::Standard,
        }
    }

    pub(crate) fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let src_color = match self {
            BlendMode::Standard => vk::BlendFactor::SRC_ALPHA,
            BlendMode::Premultiplied => vk::BlendFactor::ONE,
        };
        vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(src_color)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()
    }
}

/// Inputs for one pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig<'a> {
    pub kind: DrawKind,
    pub shaders: &'a ShaderPair,
    pub layout: vk::PipelineLayout,
    pub blend: BlendMode,
}

/// Builds one graphics pipeline for subpass 0 of `render_pass`.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    sample_count: vk::SampleCountFlags,
    config: &PipelineConfig<'_>,
    pipeline_cache: vk::PipelineCache,
) -> Result<vk::Pipeline> {
    let shaders = config.shaders;
    let vertex = ShaderModule::new(device, config.kind, ShaderStage::Vertex, &shaders.vertex)?;
    let fragment =
        ShaderModule::new(device, config.kind, ShaderStage::Fragment, &shaders.fragment)?;

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex.handle)
            .name(ENTRY_POINT)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment.handle)
            .name(ENTRY_POINT)
            .build(),
    ];

    // Geometry comes from gl_VertexIndex/gl_InstanceIndex.
    let vertex_input_state_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly_state_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only; the rectangles are set at record time.
    let viewport_state_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisample_state_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(sample_count)
        .sample_shading_enable(false);

    let color_blend_attachments = [config.blend.attachment_state()];
    let color_blend_state_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let depth_stencil_state_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .stencil_test_enable(false);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_info =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let graphics_pipeline_create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state_info)
        .input_assembly_state(&input_assembly_state_info)
        .viewport_state(&viewport_state_info)
        .rasterization_state(&rasterization_state_info)
        .multisample_state(&multisample_state_info)
        .color_blend_state(&color_blend_state_info)
        .depth_stencil_state(&depth_stencil_state_info)
        .dynamic_state(&dynamic_state_info)
        .layout(config.layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(pipeline_cache, &[graphics_pipeline_create_info], None)
    }
    .map_err(|(partial, result)| {
        for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
            unsafe { device.destroy_pipeline(pipeline, None) };
        }
        result
    })
    .in_subsystem(Subsystem::PipelineFactory, "vkCreateGraphicsPipelines")?;

    debug!("{:?} pipeline created ({:?} blend, {:?}).", config.kind, config.blend, sample_count);
    // shader modules are dropped here
    Ok(pipelines[0])
}

/// The two pipeline layouts, one per descriptor-set layout shape.
pub struct PipelineLayouts {
    device: Arc<ash::Device>,
    unified: vk::PipelineLayout,
    textured: vk::PipelineLayout,
}

impl PipelineLayouts {
    pub fn new(device: Arc<ash::Device>, descriptors: &DescriptorManager) -> Result<Self> {
        let unified_sets = [descriptors.unified_layout()];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&unified_sets);
        let unified = unsafe { device.create_pipeline_layout(&info, None) }
            .in_subsystem(Subsystem::PipelineFactory, "vkCreatePipelineLayout (unified)")?;

        let textured_sets = [descriptors.textured_layout()];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&textured_sets);
        let textured = match unsafe { device.create_pipeline_layout(&info, None) } {
            Ok(layout) => layout,
            Err(result) => {
                unsafe { device.destroy_pipeline_layout(unified, None) };
                return Err(result)
                    .in_subsystem(Subsystem::PipelineFactory, "vkCreatePipelineLayout (textured)");
            }
        };

        Ok(Self {
            device,
            unified,
            textured,
        })
    }

    pub fn for_kind(&self, kind: DrawKind) -> vk::PipelineLayout {
        if kind.is_textured() {
            self.textured
        } else {
            self.unified
        }
    }
}

impl Drop for PipelineLayouts {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.textured, None);
            self.device.destroy_pipeline_layout(self.unified, None);
        }
    }
}

/// One pipeline per draw kind, indexed by [`DrawKind::index`].
pub struct Pipelines {
    device: Arc<ash::Device>,
    pipelines: [vk::Pipeline; 4],
}

impl Pipelines {
    pub fn new(
        device: Arc<ash::Device>,
        render_pass: vk::RenderPass,
        sample_count: vk::SampleCountFlags,
        shaders: &ShaderSet,
        layouts: &PipelineLayouts,
        cache: &PipelineCacheStore,
    ) -> Result<Self> {
        let mut built = Self {
            device,
            pipelines: [vk::Pipeline::null(); 4],
        };
        for kind in DrawKind::ALL {
            let config = PipelineConfig {
                kind,
                shaders: shaders.pair(kind),
                layout: layouts.for_kind(kind),
                blend: BlendMode::for_kind(kind),
            };
            built.pipelines[kind.index()] = create_graphics_pipeline(
                &built.device,
                render_pass,
                sample_count,
                &config,
                cache.handle(),
            )?;
        }
        info!("Created {} graphics pipelines.", built.pipelines.len());
        Ok(built)
    }

    pub fn get(&self, kind: DrawKind) -> vk::Pipeline {
        self.pipelines[kind.index()]
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        for pipeline in self.pipelines {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }
}

/// Size of the version-one pipeline cache header.
const CACHE_HEADER_LEN: usize = 16 + vk::UUID_SIZE;

/// Why a persisted pipeline-cache blob was not handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheRejection {
    TooShort(usize),
    HeaderLength(u32),
    Version(u32),
    Vendor { expected: u32, found: u32 },
    Device { expected: u32, found: u32 },
    Uuid,
}

fn read_u32(blob: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&blob[at..at + 4]);
    u32::from_ne_bytes(word)
}

/// Checks a cache blob's header against the running device.
pub(crate) fn validate_cache_header(
    blob: &[u8],
    properties: &vk::PhysicalDeviceProperties,
) -> std::result::Result<(), CacheRejection> {
    if blob.len() < CACHE_HEADER_LEN {
        return Err(CacheRejection::TooShort(blob.len()));
    }
    let header_len = read_u32(blob, 0);
    if (header_len as usize) < CACHE_HEADER_LEN || header_len as usize > blob.len() {
        return Err(CacheRejection::HeaderLength(header_len));
    }
    let version = read_u32(blob, 4);
    if version != vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32 {
        return Err(CacheRejection::Version(version));
    }
    let vendor = read_u32(blob, 8);
    if vendor != properties.vendor_id {
        return Err(CacheRejection::Vendor {
            expected: properties.vendor_id,
            found: vendor,
        });
    }
    let device = read_u32(blob, 12);
    if device != properties.device_id {
        return Err(CacheRejection::Device {
            expected: properties.device_id,
            found: device,
        });
    }
    if blob[16..16 + vk::UUID_SIZE] != properties.pipeline_cache_uuid {
        return Err(CacheRejection::Uuid);
    }
    Ok(())
}

fn read_blob(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading pipeline cache {}", path.display())),
    }
}

fn write_blob(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating cache directory {}", parent.display()))?;
    }
    std::fs::write(path, bytes)
        .with_context(|| format!("writing pipeline cache {}", path.display()))
}

/// Loads a persisted blob if it exists and matches `properties`. Any problem
/// yields `None` and a warning.
pub(crate) fn load_cache_blob(
    path: &Path,
    properties: &vk::PhysicalDeviceProperties,
) -> Option<Vec<u8>> {
    let blob = match read_blob(path) {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            debug!("No pipeline cache at {}.", path.display());
            return None;
        }
        Err(err) => {
            warn!("Ignoring pipeline cache: {:#}", err);
            return None;
        }
    };
    match validate_cache_header(&blob, properties) {
        Ok(()) => Some(blob),
        Err(rejection) => {
            warn!("Ignoring incompatible pipeline cache {}: {:?}", path.display(), rejection);
            None
        }
    }
}

/// The `vk::PipelineCache` shared by every pipeline, optionally persisted.
pub struct PipelineCacheStore {
    device: Arc<ash::Device>,
    cache: vk::PipelineCache,
    path: Option<PathBuf>,
}

impl PipelineCacheStore {
    pub fn new(
        device: Arc<ash::Device>,
        properties: &vk::PhysicalDeviceProperties,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let blob = path.as_deref().and_then(|path| load_cache_blob(path, properties));

        let create = |initial: &[u8]| {
            let info = vk::PipelineCacheCreateInfo::builder().initial_data(initial);
            unsafe { device.create_pipeline_cache(&info, None) }
        };
        let cache = match blob {
            Some(blob) => match create(&blob) {
                Ok(cache) => {
                    info!("Pipeline cache seeded with {} bytes.", blob.len());
                    cache
                }
                Err(result) => {
                    warn!("Driver rejected pipeline cache blob ({}); starting empty.", result);
                    create(&[]).in_subsystem(Subsystem::PipelineFactory, "vkCreatePipelineCache")?
                }
            },
            None => create(&[]).in_subsystem(Subsystem::PipelineFactory, "vkCreatePipelineCache")?,
        };

        Ok(Self {
            device,
            cache,
            path,
        })
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Writes the cache contents back to disk. Failures are logged, never returned.
    pub fn save(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let data = match unsafe { self.device.get_pipeline_cache_data(self.cache) } {
            Ok(data) => data,
            Err(result) => {
                warn!("Could not read back pipeline cache: {}", result);
                return;
            }
        };
        match write_blob(path, &data) {
            Ok(()) => info!("Saved {} bytes of pipeline cache to {}.", data.len(), path.display()),
            Err(err) => warn!("Failed to save pipeline cache: {:#}", err),
        }
    }
}

impl Drop for PipelineCacheStore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_pipeline_cache(self.cache, None) };
    }
}
