//! Descriptor layouts, the shared pool, per-slot sets and the atlas sampler.
//!
//! Two layouts cover every pipeline:
//!
//! * unified: binding 0 storage buffer, binding 1 uniform buffer
//! * textured: the same two bindings plus binding 2 sampled image and
//!   binding 3 sampler
//!
//! The pool holds exactly enough for four sets per frame slot and is never grown.

use ash::vk;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, Subsystem, VkResultExt};
use crate::scene::DrawKind;
use crate::FRAMES_IN_FLIGHT;

pub const STORAGE_BINDING: u32 = 0;
pub const UNIFORM_BINDING: u32 = 1;
pub const IMAGE_BINDING: u32 = 2;
pub const SAMPLER_BINDING: u32 = 3;

const PIPELINE_COUNT: u32 = DrawKind::ALL.len() as u32;
const TEXTURED_PIPELINE_COUNT: u32 = PIPELINE_COUNT - 1;

/// Pool sizes for `frames` slots: one storage and one uniform descriptor per
/// pipeline, one image and one sampler per textured pipeline.
pub(crate) fn pool_sizes(frames: u32) -> [vk::DescriptorPoolSize; 4] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: PIPELINE_COUNT * frames,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: PIPELINE_COUNT * frames,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: TEXTURED_PIPELINE_COUNT * frames,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: TEXTURED_PIPELINE_COUNT * frames,
        },
    ]
}

pub(crate) fn max_sets(frames: u32) -> u32 {
    PIPELINE_COUNT * frames
}

fn buffer_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(STORAGE_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(UNIFORM_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

fn textured_bindings() -> [vk::DescriptorSetLayoutBinding; 4] {
    let [storage, uniform] = buffer_bindings();
    [
        storage,
        uniform,
        vk::DescriptorSetLayoutBinding::builder()
            .binding(IMAGE_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ]
}

/// Buffers bound by every set of one slot for one draw kind.
#[derive(Debug, Clone, Copy)]
pub struct SetBuffers {
    pub storage: vk::Buffer,
    pub uniform: vk::Buffer,
}

pub struct DescriptorManager {
    device: Arc<ash::Device>,
    unified_layout: vk::DescriptorSetLayout,
    textured_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    /// `sets[slot][kind.index()]`
    sets: [[vk::DescriptorSet; 4]; FRAMES_IN_FLIGHT],
}

impl DescriptorManager {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        // Partially built state is torn down by Drop on early return.
        let mut manager = Self {
            device,
            unified_layout: vk::DescriptorSetLayout::null(),
            textured_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sampler: vk::Sampler::null(),
            sets: [[vk::DescriptorSet::null(); 4]; FRAMES_IN_FLIGHT],
        };

        let unified = buffer_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&unified);
        let layout = unsafe { manager.device.create_descriptor_set_layout(&layout_info, None) };
        manager.unified_layout = layout
            .in_subsystem(Subsystem::DescriptorManager, "vkCreateDescriptorSetLayout (unified)")?;

        let textured = textured_bindings();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&textured);
        let layout = unsafe { manager.device.create_descriptor_set_layout(&layout_info, None) };
        manager.textured_layout = layout
            .in_subsystem(Subsystem::DescriptorManager, "vkCreateDescriptorSetLayout (textured)")?;

        let frames = FRAMES_IN_FLIGHT as u32;
        let sizes = pool_sizes(frames);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(max_sets(frames));
        manager.pool = unsafe { manager.device.create_descriptor_pool(&pool_info, None) }
            .in_subsystem(Subsystem::DescriptorManager, "vkCreateDescriptorPool")?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(0.0);
        manager.sampler = unsafe { manager.device.create_sampler(&sampler_info, None) }
            .in_subsystem(Subsystem::DescriptorManager, "vkCreateSampler")?;

        let layouts: Vec<vk::DescriptorSetLayout> = (0..FRAMES_IN_FLIGHT)
            .flat_map(|_| DrawKind::ALL.map(|kind| manager.layout_for(kind)))
            .collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(manager.pool)
            .set_layouts(&layouts);
        let sets = unsafe { manager.device.allocate_descriptor_sets(&alloc_info) }
            .in_subsystem(Subsystem::DescriptorManager, "vkAllocateDescriptorSets")?;
        for (slot, chunk) in sets.chunks_exact(DrawKind::ALL.len()).enumerate() {
            manager.sets[slot].copy_from_slice(chunk);
        }

        debug!(
            "Descriptor manager ready: {} sets across {} frame slots.",
            sets.len(),
            FRAMES_IN_FLIGHT
        );
        Ok(manager)
    }

    pub fn unified_layout(&self) -> vk::DescriptorSetLayout {
        self.unified_layout
    }

    pub fn textured_layout(&self) -> vk::DescriptorSetLayout {
        self.textured_layout
    }

    pub fn layout_for(&self, kind: DrawKind) -> vk::DescriptorSetLayout {
        if kind.is_textured() {
            self.textured_layout
        } else {
            self.unified_layout
        }
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn set(&self, slot: usize, kind: DrawKind) -> vk::DescriptorSet {
        self.sets[slot][kind.index()]
    }

    /// Writes the storage and uniform bindings of the primitive set for `slot`.
    pub fn update_unified_set(&self, slot: usize, buffers: SetBuffers) {
        let storage_info = [vk::DescriptorBufferInfo {
            buffer: buffers.storage,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let uniform_info = [vk::DescriptorBufferInfo {
            buffer: buffers.uniform,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let set = self.set(slot, DrawKind::Primitive);
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(STORAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&storage_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info)
                .build(),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    /// Writes all four bindings of the textured set for (`slot`, `kind`).
    ///
    /// Must be called for every slot whenever the atlas behind `image_view`
    /// is recreated, with no submission referencing the old view in flight.
    pub fn update_textured_set(
        &self,
        slot: usize,
        kind: DrawKind,
        buffers: SetBuffers,
        image_view: vk::ImageView,
    ) {
        debug_assert!(kind.is_textured(), "{kind:?} has no textured set");
        let storage_info = [vk::DescriptorBufferInfo {
            buffer: buffers.storage,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let uniform_info = [vk::DescriptorBufferInfo {
            buffer: buffers.uniform,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let sampler_info = [vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }];
        let set = self.set(slot, kind);
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(STORAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&storage_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(UNIFORM_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info)
                .build(),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for DescriptorManager {
    fn drop(&mut self) {
        unsafe {
            // Sets are freed with the pool.
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_descriptor_set_layout(self.textured_layout, None);
            self.device.destroy_descriptor_set_layout(self.unified_layout, None);
        }
        debug!("Descriptor manager destroyed.");
    }
}
