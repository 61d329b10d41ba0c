//! Atlas uploads against a real device: a full upload followed by a partial
//! one must leave the image equal to the CPU composite of both payloads.
//!
//! Skipped with a warning when no Vulkan implementation is available.

use ash::vk;
use std::sync::Arc;
use tracing::warn;

use novade_ui_renderer::atlas::{
    record_atlas_transfers, AtlasKind, AtlasStreamer, DirtyRect, PendingUploads,
};
use novade_ui_renderer::config::RendererConfig;
use novade_ui_renderer::device::GpuContext;
use novade_ui_renderer::logging::init_logging;
use novade_ui_renderer::memory::{MemoryPool, PoolBuffer};
use novade_ui_renderer::sync::FrameSyncPrimitives;
use novade_ui_renderer::FRAMES_IN_FLIGHT;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;
const LANE_BYTES: u64 = 64 * 1024;

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Deterministic pattern so both payloads differ everywhere.
fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn composite(base: &[u8], update: &[u8], rect: DirtyRect, bytes_per_pixel: u32) -> Vec<u8> {
    let mut expected = base.to_vec();
    let row_bytes = (WIDTH * bytes_per_pixel) as usize;
    let bpp = bytes_per_pixel as usize;
    for y in rect.y..rect.y + rect.height {
        let start = y as usize * row_bytes + rect.x as usize * bpp;
        let end = start + rect.width as usize * bpp;
        expected[start..end].copy_from_slice(&update[start..end]);
    }
    expected
}

struct Recorder {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl Recorder {
    fn new(ctx: &GpuContext) -> Self {
        let device = Arc::clone(ctx.device());
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(ctx.queue_family_index());
        let pool = unsafe { device.create_command_pool(&pool_info, None) }.unwrap();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }.unwrap()[0];
        Self {
            device,
            queue: ctx.queue(),
            pool,
            command_buffer,
        }
    }

    /// Records with `record`, submits signalling `sync`'s fence and waits for it.
    fn submit_and_wait(
        &self,
        sync: &FrameSyncPrimitives,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) {
        let device = &self.device;
        unsafe {
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .unwrap();
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.command_buffer, &begin_info).unwrap();
        }
        record(device, self.command_buffer);
        unsafe { device.end_command_buffer(self.command_buffer).unwrap() };

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
        sync.wait().unwrap();
        sync.reset().unwrap();
        unsafe {
            device
                .queue_submit(self.queue, &[submit_info], sync.in_flight_fence)
                .unwrap();
        }
        sync.wait().unwrap();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

fn read_back(
    recorder: &Recorder,
    sync: &FrameSyncPrimitives,
    image: vk::Image,
    readback: &PoolBuffer,
) -> Vec<u8> {
    recorder.submit_and_wait(sync, |device, cmd| {
        let to_src = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_range())
            .src_access_mask(vk::AccessFlags::SHADER_READ)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .build();
        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: WIDTH,
                height: HEIGHT,
                depth: 1,
            })
            .build();
        let to_host = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(readback.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_src],
            );
            device.cmd_copy_image_to_buffer(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.handle(),
                &[region],
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[to_host],
                &[],
            );
        }
    });
    readback.bytes().expect("readback buffer is mapped").to_vec()
}

#[test]
fn full_then_partial_upload_matches_cpu_composite() {
    init_logging(tracing::Level::DEBUG);

    // Declared first so it is dropped after every resource created from it.
    let ctx = match GpuContext::new_headless(&RendererConfig::default()) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("Skipping atlas readback test, no usable Vulkan device: {}", e);
            return;
        }
    };
    let device = Arc::clone(ctx.device());

    let readback_bytes = u64::from(WIDTH * HEIGHT * 4);
    let mut pool = MemoryPool::new(
        Arc::clone(&device),
        ctx.memory_properties(),
        LANE_BYTES * FRAMES_IN_FLIGHT as u64 + readback_bytes + 64 * 1024,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .expect("host pool");
    let mut streamer = AtlasStreamer::new(
        Arc::clone(&device),
        *ctx.memory_properties(),
        &mut pool,
        LANE_BYTES,
    )
    .expect("atlas streamer");
    let readback = pool
        .create_buffer(readback_bytes, vk::BufferUsageFlags::TRANSFER_DST)
        .expect("readback buffer");

    let sync: Vec<FrameSyncPrimitives> = (0..FRAMES_IN_FLIGHT)
        .map(|_| FrameSyncPrimitives::new(Arc::clone(&device)).expect("sync primitives"))
        .collect();
    let recorder = Recorder::new(&ctx);

    for kind in [AtlasKind::Glyph, AtlasKind::Image] {
        let bpp = kind.bytes_per_pixel();
        let len = (WIDTH * HEIGHT * bpp) as usize;
        let first = payload(len, 7);
        let second = payload(len, 101);
        let rect = DirtyRect::new(5, 3, 17, 11);

        // Frame on slot 0: creates the atlas and uploads everything.
        let mut rebound = Vec::new();
        let mut uploads = PendingUploads::new();
        uploads.stage(kind, &first, WIDTH, HEIGHT, Some(DirtyRect::full(WIDTH, HEIGHT)));
        let transfers = streamer
            .stream(0, &mut uploads, &sync, |slot, _, _| rebound.push(slot))
            .expect("first stream");
        assert_eq!(rebound, vec![0, 1, 2]);
        assert_eq!(transfers.len(), 1);
        assert!(uploads.is_empty());
        recorder.submit_and_wait(&sync[0], |device, cmd| {
            record_atlas_transfers(device, cmd, streamer.staging_buffer(), &transfers)
        });

        // Frame on slot 1: only the dirty rectangle changes.
        let mut uploads = PendingUploads::new();
        uploads.stage(kind, &second, WIDTH, HEIGHT, Some(rect));
        let transfers = streamer
            .stream(1, &mut uploads, &sync, |_, _, _| panic!("same-size upload must not recreate"))
            .expect("second stream");
        assert_eq!(transfers.len(), 1);
        recorder.submit_and_wait(&sync[1], |device, cmd| {
            record_atlas_transfers(device, cmd, streamer.staging_buffer(), &transfers)
        });

        let image = streamer.atlas(kind).expect("atlas exists").image.image;
        let actual = read_back(&recorder, &sync[2], image, &readback);
        let expected = composite(&first, &second, rect, bpp);
        assert!(
            actual[..len] == expected[..],
            "{kind:?} atlas differs from the CPU composite"
        );
    }

    assert_eq!(streamer.recreations(), 2);
    assert_eq!(streamer.uploads(), 4);
    unsafe { device.device_wait_idle() }.expect("device idle");
}
