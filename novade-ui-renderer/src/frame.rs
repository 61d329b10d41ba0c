//! Frame coordinator: owns every GPU resource and drives one frame per
//! `render` call across [`FRAMES_IN_FLIGHT`] slots.
//!
//! Per call: wait the slot's fence, acquire an image, stream atlas uploads
//! into the slot's lane, write the slot's instance and uniform buffers,
//! record, submit, present, advance. A slot's buffers are only written after
//! its fence has signaled.
//!
//! The sequencing lives in `FrameLoop`, which drives a `FrameTarget`.
//! `FrameResources` is the Vulkan target. Any error leaves the loop lost:
//! a failure after the fence reset or the acquire leaves a fence or semaphore
//! in a state no later frame can wait on.

use ash::vk;
use bytemuck::Pod;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::mem::size_of;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::atlas::{record_atlas_transfers, AtlasKind, AtlasStreamer, PendingUploads};
use crate::config::RendererConfig;
use crate::descriptors::{DescriptorManager, SetBuffers};
use crate::device::GpuContext;
use crate::error::{InitError, RendererError, Result, Subsystem, VkResultExt};
use crate::memory::{align_up, MemoryPool, PoolBuffer};
use crate::pipeline::{
    PipelineCacheStore, PipelineLayouts, Pipelines, VERTICES_PER_INSTANCE,
};
use crate::scene::{DrawKind, Scene};
use crate::shader::ShaderSet;
use crate::surface::{AcquireOutcome, PresentationSurface};
use crate::sync::{wait_all, FramePacer, FrameSyncPrimitives};
use crate::types::{write_instances, GpuGlyph, GpuImage, GpuPrimitive, GpuSvg, Uniforms};
use crate::FRAMES_IN_FLIGHT;

/// Worst-case padding assumed per pool allocation.
const POOL_ALIGNMENT_SLACK: u64 = 4096;

/// Counters since init.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub surface_rebuilds: u64,
    pub atlas_recreations: u64,
    pub atlas_uploads: u64,
}

/// Outcome of one [`FrameCoordinator::render`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { slot: usize, image_index: u32 },
    /// The surface was stale or zero-sized; nothing was submitted.
    Skipped,
}

/// Size in bytes of one slot's instance array for `kind`.
pub(crate) const fn instance_buffer_size(kind: DrawKind) -> u64 {
    let record = match kind {
        DrawKind::Primitive => size_of::<GpuPrimitive>(),
        DrawKind::Glyph => size_of::<GpuGlyph>(),
        DrawKind::Vector => size_of::<GpuSvg>(),
        DrawKind::Image => size_of::<GpuImage>(),
    };
    (record * kind.capacity()) as u64
}

/// Host pool capacity: per-slot instance and uniform buffers plus the staging
/// lanes, each with alignment slack.
pub(crate) fn host_pool_size(staging_lane_bytes: u64) -> u64 {
    let per_slot: u64 = DrawKind::ALL
        .iter()
        .map(|&kind| instance_buffer_size(kind) + POOL_ALIGNMENT_SLACK)
        .sum::<u64>()
        + size_of::<Uniforms>() as u64
        + POOL_ALIGNMENT_SLACK;
    let staging = staging_lane_bytes * FRAMES_IN_FLIGHT as u64 + POOL_ALIGNMENT_SLACK;
    align_up(per_slot * FRAMES_IN_FLIGHT as u64 + staging, POOL_ALIGNMENT_SLACK)
}

/// Swapchain size in physical pixels for a logical size and DPI scale.
pub(crate) fn physical_extent(width: u32, height: u32, scale_factor: f32) -> vk::Extent2D {
    let scale = if scale_factor.is_finite() && scale_factor > 0.0 {
        scale_factor
    } else {
        1.0
    };
    vk::Extent2D {
        width: (width as f32 * scale).round() as u32,
        height: (height as f32 * scale).round() as u32,
    }
}

/// Per-slot buffers and command buffer.
struct FrameSlot {
    /// Indexed by [`DrawKind::index`].
    instances: Vec<PoolBuffer>,
    uniforms: PoolBuffer,
    command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    fn set_buffers(&self, kind: DrawKind) -> SetBuffers {
        SetBuffers {
            storage: self.instances[kind.index()].handle(),
            uniform: self.uniforms.handle(),
        }
    }

    /// Converts the scene into this slot's mapped buffers; returns the instance
    /// count written per draw kind.
    fn write_scene(&mut self, scene: &Scene<'_>) -> [u32; 4] {
        fn fill<'s, S, G>(buffer: &mut PoolBuffer, src: &'s [S]) -> u32
        where
            G: From<&'s S> + Pod,
        {
            buffer
                .as_slice_mut::<G>()
                .map_or(0, |dst| write_instances(dst, src) as u32)
        }

        let mut counts = [0u32; 4];
        for kind in DrawKind::ALL {
            let n = scene.instance_count(kind);
            let buffer = &mut self.instances[kind.index()];
            counts[kind.index()] = match kind {
                DrawKind::Primitive => fill::<_, GpuPrimitive>(buffer, &scene.primitives[..n]),
                DrawKind::Glyph => fill::<_, GpuGlyph>(buffer, &scene.glyphs[..n]),
                DrawKind::Vector => fill::<_, GpuSvg>(buffer, &scene.vectors[..n]),
                DrawKind::Image => fill::<_, GpuImage>(buffer, &scene.images[..n]),
            };
        }
        counts
    }

    fn write_uniforms(&mut self, uniforms: &Uniforms) {
        if let Some(bytes) = self.uniforms.bytes_mut() {
            let src = bytemuck::bytes_of(uniforms);
            bytes[..src.len()].copy_from_slice(src);
        }
    }
}

struct CommandPool {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
}

impl CommandPool {
    fn new(device: Arc<ash::Device>, queue_family_index: u32) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let pool = unsafe { device.create_command_pool(&info, None) }
            .in_subsystem(Subsystem::FrameCoordinator, "vkCreateCommandPool")?;
        Ok(Self { device, pool })
    }

    fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
            .in_subsystem(Subsystem::FrameCoordinator, "vkAllocateCommandBuffers")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // frees the command buffers too
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

/// The device-facing steps of one frame, driven in order by [`FrameLoop`].
pub(crate) trait FrameTarget {
    /// Blocks until no slot has work executing.
    fn wait_all(&mut self) -> Result<()>;
    /// Rebuilds the swapchain for the current size. `false` while the surface
    /// is zero-sized.
    fn rebuild_surface(&mut self) -> Result<bool>;
    fn wait_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// Streams atlas uploads, writes the slot's buffers and records its
    /// command buffer.
    fn record(
        &mut self,
        slot: usize,
        image_index: u32,
        scene: &Scene<'_>,
        uploads: &mut PendingUploads<'_>,
    ) -> Result<()>;
    /// Resets the slot's fence and submits its command buffer.
    fn submit(&mut self, slot: usize) -> Result<()>;
    /// Returns true when the surface has to be rebuilt.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<bool>;
}

/// Frame sequencing state: slot pacing, surface staleness and counters.
#[derive(Debug, Clone)]
pub(crate) struct FrameLoop {
    pacer: FramePacer,
    surface_stale: bool,
    lost: bool,
    stats: FrameStats,
}

impl FrameLoop {
    pub(crate) fn new(surface_stale: bool) -> Self {
        Self {
            pacer: FramePacer::new(),
            surface_stale,
            lost: false,
            stats: FrameStats::default(),
        }
    }

    pub(crate) fn render<T: FrameTarget>(
        &mut self,
        target: &mut T,
        scene: &Scene<'_>,
        uploads: &mut PendingUploads<'_>,
    ) -> Result<FrameStatus> {
        self.guarded(|this| this.advance(target, scene, uploads))
    }

    /// Waits for every slot and rebuilds the surface.
    pub(crate) fn rebuild<T: FrameTarget>(&mut self, target: &mut T) -> Result<()> {
        self.guarded(|this| this.rebuild_surface(target))
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost
    }

    fn guarded<R>(&mut self, step: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if self.lost {
            return Err(RendererError::CoordinatorLost);
        }
        let result = step(self);
        if let Err(err) = &result {
            error!("Frame coordinator stopped: {}", err);
            self.lost = true;
        }
        result
    }

    fn rebuild_surface<T: FrameTarget>(&mut self, target: &mut T) -> Result<()> {
        target.wait_all()?;
        self.pacer.retire_all();
        if target.rebuild_surface()? {
            self.surface_stale = false;
            self.stats.surface_rebuilds += 1;
        } else {
            self.surface_stale = true;
        }
        Ok(())
    }

    fn advance<T: FrameTarget>(
        &mut self,
        target: &mut T,
        scene: &Scene<'_>,
        uploads: &mut PendingUploads<'_>,
    ) -> Result<FrameStatus> {
        if self.surface_stale {
            self.rebuild_surface(target)?;
            if self.surface_stale {
                self.stats.frames_skipped += 1;
                return Ok(FrameStatus::Skipped);
            }
        }

        let slot = self.pacer.current_slot();
        target.wait_slot(slot)?;
        self.pacer.retire_current();

        let image_index = match target.acquire(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.surface_stale = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                debug!("Swapchain out of date, skipping frame.");
                self.surface_stale = true;
                self.stats.frames_skipped += 1;
                return Ok(FrameStatus::Skipped);
            }
        };

        target.record(slot, image_index, scene, uploads)?;
        target.submit(slot)?;
        if target.present(slot, image_index)? {
            debug!("Presentation reported a stale surface; rebuilding next frame.");
            self.surface_stale = true;
        }

        self.pacer.submit_and_advance();
        self.stats.frames_presented += 1;
        trace!(
            "Frame {} presented from slot {} (image {}).",
            self.pacer.submitted(),
            slot,
            image_index
        );
        Ok(FrameStatus::Presented { slot, image_index })
    }
}

/// Every GPU resource of the coordinator.
///
/// Fields are declared in reverse creation order so that dropping destroys
/// handles children-first.
pub(crate) struct FrameResources {
    sync: Vec<FrameSyncPrimitives>,
    command_pool: CommandPool,
    slots: Vec<FrameSlot>,
    atlas: AtlasStreamer,
    pipelines: Pipelines,
    pipeline_layouts: PipelineLayouts,
    pipeline_cache: PipelineCacheStore,
    descriptors: DescriptorManager,
    host_pool: MemoryPool,
    surface: PresentationSurface,
    ctx: GpuContext,

    logical_size: (u32, u32),
    scale_factor: f32,
    clear_color: [f32; 4],
}

impl FrameResources {
    fn uniforms(&self) -> Uniforms {
        let (width, height) = self.logical_size;
        let size_of_atlas = |kind: AtlasKind| {
            self.atlas
                .extent(kind)
                .map_or([0.0, 0.0], |extent| [extent.width as f32, extent.height as f32])
        };
        Uniforms {
            glyph_atlas_size: size_of_atlas(AtlasKind::Glyph),
            vector_atlas_size: size_of_atlas(AtlasKind::Vector),
            image_atlas_size: size_of_atlas(AtlasKind::Image),
            ..Uniforms::for_viewport(width as f32, height as f32, self.scale_factor)
        }
    }

    fn record_draws(
        &self,
        command_buffer: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        counts: &[u32; 4],
    ) {
        let device = self.ctx.device();
        let extent = self.surface.extent();
        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };
        // One value per attachment; the resolve target ignores its value.
        let clear_values = [clear, clear];
        let attachment_count = if self.surface.sample_count() == vk::SampleCountFlags::TYPE_1 {
            1
        } else {
            2
        };
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let render_pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.surface.render_pass())
            .framebuffer(self.surface.framebuffer(image_index))
            .render_area(render_area)
            .clear_values(&clear_values[..attachment_count]);

        let viewport = vk::Viewport::builder()
            .x(0.0)
            .y(0.0)
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0)
            .build();

        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);

            for kind in DrawKind::ALL {
                let count = counts[kind.index()];
                if count == 0 {
                    continue;
                }
                if let Some(atlas_kind) = AtlasKind::for_draw_kind(kind) {
                    if self.atlas.atlas(atlas_kind).is_none() {
                        trace!("{:?} draws skipped: atlas not uploaded yet.", kind);
                        continue;
                    }
                }
                device.cmd_bind_pipeline(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipelines.get(kind),
                );
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline_layouts.for_kind(kind),
                    0,
                    &[self.descriptors.set(slot, kind)],
                    &[],
                );
                device.cmd_draw(command_buffer, VERTICES_PER_INSTANCE, count, 0, 0);
            }

            device.cmd_end_render_pass(command_buffer);
        }
    }
}

impl FrameTarget for FrameResources {
    fn wait_all(&mut self) -> Result<()> {
        wait_all(&self.sync)
    }

    fn rebuild_surface(&mut self) -> Result<bool> {
        let (width, height) = self.logical_size;
        let physical = physical_extent(width, height, self.scale_factor);
        self.surface.rebuild(physical.width, physical.height)
    }

    fn wait_slot(&mut self, slot: usize) -> Result<()> {
        self.sync[slot].wait()
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.surface.acquire(self.sync[slot].image_available_semaphore)
    }

    fn record(
        &mut self,
        slot: usize,
        image_index: u32,
        scene: &Scene<'_>,
        uploads: &mut PendingUploads<'_>,
    ) -> Result<()> {
        let transfers = {
            let descriptors = &self.descriptors;
            let slots = &self.slots;
            self.atlas.stream(slot, uploads, &self.sync, |target, kind, view| {
                let draw_kind = kind.draw_kind();
                let buffers = slots[target].set_buffers(draw_kind);
                descriptors.update_textured_set(target, draw_kind, buffers, view);
            })?
        };

        let uniforms = self.uniforms();
        let frame = &mut self.slots[slot];
        let counts = frame.write_scene(scene);
        frame.write_uniforms(&uniforms);
        let command_buffer = frame.command_buffer;

        let device = self.ctx.device();
        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .in_subsystem(Subsystem::FrameCoordinator, "vkResetCommandBuffer")?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .in_subsystem(Subsystem::FrameCoordinator, "vkBeginCommandBuffer")?;
        }

        record_atlas_transfers(device, command_buffer, self.atlas.staging_buffer(), &transfers);
        self.record_draws(command_buffer, slot, image_index, &counts);

        unsafe {
            device
                .end_command_buffer(command_buffer)
                .in_subsystem(Subsystem::FrameCoordinator, "vkEndCommandBuffer")?;
        }
        trace!("Slot {} recorded with {} atlas transfers.", slot, transfers.len());
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let sync = &self.sync[slot];
        let wait_semaphores = [sync.image_available_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished_semaphore];
        let command_buffers = [self.slots[slot].command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        // Reset only once a submission that signals the fence is certain.
        sync.reset()?;
        let device = self.ctx.device();
        unsafe { device.queue_submit(self.ctx.queue(), &[submit_info], sync.in_flight_fence) }
            .in_subsystem(Subsystem::FrameCoordinator, "vkQueueSubmit")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<bool> {
        let semaphore = self.sync[slot].render_finished_semaphore;
        self.surface.present(self.ctx.queue(), image_index, semaphore)
    }
}

/// Root of the renderer.
pub struct FrameCoordinator {
    gpu: FrameResources,
    frame_loop: FrameLoop,
}

impl FrameCoordinator {
    /// Brings up the device, surface and every per-frame resource.
    ///
    /// `width` and `height` are logical pixels; the swapchain is sized
    /// `width * scale_factor` by `height * scale_factor`.
    pub fn init<W>(
        window: &W,
        width: u32,
        height: u32,
        scale_factor: f32,
        config: &RendererConfig,
        shaders: &ShaderSet,
    ) -> std::result::Result<Self, InitError>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        config.validate()?;
        shaders.validate()?;

        let ctx = GpuContext::new(window, config)?;
        let device = Arc::clone(ctx.device());
        let physical = physical_extent(width, height, scale_factor);

        let surface = PresentationSurface::new(&ctx, config, physical.width, physical.height)?;

        let mut host_pool = MemoryPool::new(
            Arc::clone(&device),
            ctx.memory_properties(),
            host_pool_size(config.staging_lane_bytes),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let descriptors = DescriptorManager::new(Arc::clone(&device))?;
        let pipeline_cache = PipelineCacheStore::new(
            Arc::clone(&device),
            ctx.properties(),
            config.pipeline_cache_path.clone(),
        )?;
        let pipeline_layouts = PipelineLayouts::new(Arc::clone(&device), &descriptors)?;
        let pipelines = Pipelines::new(
            Arc::clone(&device),
            surface.render_pass(),
            surface.sample_count(),
            shaders,
            &pipeline_layouts,
            &pipeline_cache,
        )?;

        let atlas = AtlasStreamer::new(
            Arc::clone(&device),
            *ctx.memory_properties(),
            &mut host_pool,
            config.staging_lane_bytes,
        )?;

        let command_pool = CommandPool::new(Arc::clone(&device), ctx.queue_family_index())?;
        let command_buffers = command_pool.allocate(FRAMES_IN_FLIGHT as u32)?;

        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for (slot, command_buffer) in command_buffers.into_iter().enumerate() {
            let mut instances = Vec::with_capacity(DrawKind::ALL.len());
            for kind in DrawKind::ALL {
                instances.push(host_pool.create_buffer(
                    instance_buffer_size(kind),
                    vk::BufferUsageFlags::STORAGE_BUFFER,
                )?);
            }
            let uniforms = host_pool.create_buffer(
                size_of::<Uniforms>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            let frame_slot = FrameSlot {
                instances,
                uniforms,
                command_buffer,
            };
            descriptors.update_unified_set(slot, frame_slot.set_buffers(DrawKind::Primitive));
            slots.push(frame_slot);
        }
        debug!("Host pool: {} of {} bytes used.", host_pool.used(), host_pool.capacity());

        let sync = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSyncPrimitives::new(Arc::clone(&device)))
            .collect::<Result<Vec<_>>>()?;

        let surface_image_count = surface.image_count();
        info!(
            "Frame coordinator ready: {}x{} logical at scale {}, {} frames in flight.",
            width, height, scale_factor, FRAMES_IN_FLIGHT
        );

        Ok(Self {
            gpu: FrameResources {
                sync,
                command_pool,
                slots,
                atlas,
                pipelines,
                pipeline_layouts,
                pipeline_cache,
                descriptors,
                host_pool,
                surface,
                ctx,
                logical_size: (width, height),
                scale_factor,
                clear_color: config.clear_color,
            },
            // a minimized window yields no swapchain until the next rebuild
            frame_loop: FrameLoop::new(surface_image_count == 0),
        })
    }

    /// Applies a new logical size and scale. Waits for every in-flight frame
    /// and rebuilds the presentation surface at the physical extent.
    pub fn resize(&mut self, width: u32, height: u32, scale_factor: f32) -> Result<()> {
        self.gpu.logical_size = (width, height);
        self.gpu.scale_factor = scale_factor;
        self.frame_loop.rebuild(&mut self.gpu)
    }

    /// Draws `scene` and applies the atlas changes staged in `uploads`.
    ///
    /// Uploads are consumed when the frame gets far enough to stream them;
    /// a skipped frame leaves them in place. Only device-level failures are
    /// returned as errors. After one, every later call returns
    /// [`RendererError::CoordinatorLost`].
    pub fn render(
        &mut self,
        scene: &Scene<'_>,
        uploads: &mut PendingUploads<'_>,
    ) -> Result<FrameStatus> {
        self.frame_loop.render(&mut self.gpu, scene, uploads)
    }

    /// Waits for the device to go idle, persists the pipeline cache and
    /// releases every resource.
    pub fn deinit(self) {
        if let Err(err) = self.gpu.ctx.wait_idle() {
            warn!("Device wait failed during shutdown: {}", err);
        }
        self.gpu.pipeline_cache.save();
        let stats = self.stats();
        info!(
            "Frame coordinator shut down after {} frames ({} skipped).",
            stats.frames_presented, stats.frames_skipped
        );
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            atlas_recreations: self.gpu.atlas.recreations(),
            atlas_uploads: self.gpu.atlas.uploads(),
            ..self.frame_loop.stats
        }
    }

    /// True once a failed frame has made the coordinator unusable.
    pub fn is_lost(&self) -> bool {
        self.frame_loop.is_lost()
    }

    pub fn current_slot(&self) -> usize {
        self.frame_loop.pacer.current_slot()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frame_loop.pacer.submitted()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame_loop.pacer.in_flight_count()
    }

    /// Swapchain extent in physical pixels.
    pub fn extent(&self) -> vk::Extent2D {
        self.gpu.surface.extent()
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.gpu.surface.sample_count()
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.gpu.surface.present_mode()
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu.ctx
    }

    pub fn host_pool_usage(&self) -> (u64, u64) {
        (self.gpu.host_pool.used(), self.gpu.host_pool.capacity())
    }
}

impl Drop for FrameCoordinator {
    fn drop(&mut self) {
        // Fields are released after this body; nothing may still be executing.
        if let Err(err) = self.gpu.ctx.wait_idle() {
            warn!("Device wait failed while dropping frame coordinator: {}", err);
        }
    }
}
