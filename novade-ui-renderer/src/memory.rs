//! Memory pool: one device allocation carved up by a bump cursor.
//!
//! All per-frame buffers (instance arrays, uniforms, staging lanes) live in a
//! single host-visible, host-coherent allocation that stays mapped for the
//! pool's lifetime. Sub-allocations are never freed individually; the pool
//! is either reset wholesale or dropped.
//!
//! Exhausting the pool or binding a resource whose memory-type bits exclude the
//! pool's type are sizing defects, so both are asserted.

use ash::vk;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RendererError, Result, Subsystem, VkResultExt};

/// Buffer usages the pool is expected to back. Used to find compatible memory types.
const PROBE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// Rounds `value` up to the next multiple of `alignment`. Zero alignment is treated as one.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Returns the first memory type allowed by `type_bits` that has all of `required`.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
}

/// Monotonic offset cursor over a fixed-size range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BumpCursor {
    size: u64,
    offset: u64,
}

impl BumpCursor {
    pub const fn new(size: u64) -> Self {
        Self { size, offset: 0 }
    }

    /// Reserves `size` bytes at the next offset aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// If the reservation would end past the cursor's capacity.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> u64 {
        let start = align_up(self.offset, alignment);
        let end = start.checked_add(size);
        assert!(
            matches!(end, Some(end) if end <= self.size),
            "memory pool exhausted: {} bytes at offset {} exceed capacity {}",
            size,
            start,
            self.size
        );
        self.offset = start + size;
        start
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.size
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.offset
    }
}

/// A region handed out by [`MemoryPool::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct SubAllocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    /// Host pointer to `offset`, or null when the pool is not host-visible.
    pub mapped: *mut u8,
}

pub struct MemoryPool {
    device: Arc<ash::Device>,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    cursor: BumpCursor,
    mapped: *mut u8,
}

impl MemoryPool {
    /// Allocates `size` bytes from a memory type that can back storage, uniform
    /// and transfer buffers and has every flag in `required`. Host-visible pools
    /// are mapped once here and stay mapped until drop.
    pub fn new(
        device: Arc<ash::Device>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        required: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let scratch_info = vk::BufferCreateInfo::builder()
            .size(size.min(64 * 1024))
            .usage(PROBE_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let scratch = unsafe { device.create_buffer(&scratch_info, None) }
            .in_subsystem(Subsystem::MemoryPool, "vkCreateBuffer (scratch)")?;
        let scratch_requirements = unsafe { device.get_buffer_memory_requirements(scratch) };
        unsafe { device.destroy_buffer(scratch, None) };

        let memory_type_index =
            find_memory_type(memory_properties, scratch_requirements.memory_type_bits, required)
                .ok_or(RendererError::NoSuitableMemoryType {
                    subsystem: Subsystem::MemoryPool,
                    required,
                })?;
        let property_flags =
            memory_properties.memory_types[memory_type_index as usize].property_flags;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .in_subsystem(Subsystem::MemoryPool, "vkAllocateMemory")?;

        let mapped = if property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let flags = vk::MemoryMapFlags::empty();
            match unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, flags) } {
                Ok(ptr) => ptr.cast::<u8>(),
                Err(result) => {
                    unsafe { device.free_memory(memory, None) };
                    return Err(RendererError::Vulkan {
                        subsystem: Subsystem::MemoryPool,
                        operation: "vkMapMemory",
                        result,
                    });
                }
            }
        } else {
            ptr::null_mut()
        };

        info!(
            "Memory pool created: {} bytes, type {} ({:?}), mapped: {}.",
            size,
            memory_type_index,
            property_flags,
            !mapped.is_null()
        );

        Ok(Self {
            device,
            memory,
            memory_type_index,
            cursor: BumpCursor::new(size),
            mapped,
        })
    }

    /// Reserves a region satisfying `requirements`.
    ///
    /// # Panics
    ///
    /// If the requirements exclude the pool's memory type or the pool is exhausted.
    pub fn allocate(&mut self, requirements: &vk::MemoryRequirements) -> SubAllocation {
        assert!(
            requirements.memory_type_bits & (1 << self.memory_type_index) != 0,
            "resource memory type bits {:#b} exclude pool memory type {}",
            requirements.memory_type_bits,
            self.memory_type_index
        );
        let offset = self.cursor.allocate(requirements.size, requirements.alignment);
        let mapped = if self.mapped.is_null() {
            ptr::null_mut()
        } else {
            // within the mapped range, checked by the cursor
            unsafe { self.mapped.add(offset as usize) }
        };
        SubAllocation {
            memory: self.memory,
            offset,
            mapped,
        }
    }

    /// Creates a buffer of `size` bytes bound inside the pool.
    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<PoolBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .in_subsystem(Subsystem::MemoryPool, "vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocate(&requirements);

        if let Err(result) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory, allocation.offset) }
        {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(RendererError::Vulkan {
                subsystem: Subsystem::MemoryPool,
                operation: "vkBindBufferMemory",
                result,
            });
        }
        debug!(
            "Pool buffer {:?}: {} bytes at offset {} ({:?}).",
            buffer, size, allocation.offset, usage
        );

        Ok(PoolBuffer {
            device: Arc::clone(&self.device),
            buffer,
            size,
            mapped: allocation.mapped,
        })
    }

    /// Rewinds the cursor. Every buffer previously created from the pool must
    /// already be destroyed.
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn used(&self) -> u64 {
        self.cursor.used()
    }

    pub fn capacity(&self) -> u64 {
        self.cursor.capacity()
    }

    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        unsafe {
            if !self.mapped.is_null() {
                self.device.unmap_memory(self.memory);
            }
            self.device.free_memory(self.memory, None);
        }
        debug!("Memory pool freed ({} of {} bytes used).", self.used(), self.capacity());
    }
}

/// A buffer bound inside a [`MemoryPool`]. Dropping it destroys only the
/// buffer handle; the backing memory belongs to the pool.
pub struct PoolBuffer {
    device: Arc<ash::Device>,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    mapped: *mut u8,
}

impl PoolBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Mapped bytes of the buffer, or `None` for device-local pools.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.mapped.is_null() {
            return None;
        }
        // SAFETY: the pool keeps the range [offset, offset + size) mapped for
        // its whole lifetime and no other buffer overlaps it.
        Some(unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) })
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        if self.mapped.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.mapped, self.size as usize) })
    }

    /// The mapped buffer viewed as an array of `T`.
    pub fn as_slice_mut<T: bytemuck::Pod>(&mut self) -> Option<&mut [T]> {
        let count = self.size as usize / std::mem::size_of::<T>();
        self.bytes_mut()
            .map(|bytes| bytemuck::cast_slice_mut(&mut bytes[..count * std::mem::size_of::<T>()]))
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Parameters for a [`DeviceImage`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    /// Tried first; `DEVICE_LOCAL` is the fallback.
    pub preferred_memory: vk::MemoryPropertyFlags,
}

/// A 2D image with its own device-local allocation and a color view.
///
/// Used for resources whose size changes at runtime (MSAA target, atlases),
/// which therefore cannot live in a bump-allocated pool.
pub struct DeviceImage {
    device: Arc<ash::Device>,
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl DeviceImage {
    pub fn new(
        device: Arc<ash::Device>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &ImageDesc,
        subsystem: Subsystem,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // Handles are filled in as they are created; Drop skips null ones.
        let mut created = Self {
            device,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            extent: desc.extent,
            format: desc.format,
        };
        created.image = unsafe { created.device.create_image(&image_info, None) }
            .in_subsystem(subsystem, "vkCreateImage")?;

        let requirements = unsafe { created.device.get_image_memory_requirements(created.image) };
        let memory_type_index = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            desc.preferred_memory,
        )
        .or_else(|| {
            find_memory_type(
                memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
        })
        .ok_or(RendererError::NoSuitableMemoryType {
            subsystem,
            required: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        created.memory = unsafe { created.device.allocate_memory(&alloc_info, None) }
            .in_subsystem(subsystem, "vkAllocateMemory (image)")?;
        unsafe { created.device.bind_image_memory(created.image, created.memory, 0) }
            .in_subsystem(subsystem, "vkBindImageMemory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(created.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(color_subresource_range());
        created.view = unsafe { created.device.create_image_view(&view_info, None) }
            .in_subsystem(subsystem, "vkCreateImageView")?;

        debug!(
            "Image {:?} created: {}x{} {:?}, {:?} samples.",
            created.image, desc.extent.width, desc.extent.height, desc.format, desc.samples
        );
        Ok(created)
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Single-mip, single-layer color range.
pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 16, 0)]
    #[case(1, 16, 16)]
    #[case(16, 16, 16)]
    #[case(17, 256, 256)]
    #[case(5, 0, 5)]
    #[case(5, 1, 5)]
    fn align_up_rounds_to_multiple(
        #[case] value: u64,
        #[case] alignment: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(align_up(value, alignment), expected);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut cursor = BumpCursor::new(4096);
        let requests = [(10u64, 4u64), (100, 64), (1, 1), (33, 256), (8, 16), (500, 128)];
        let mut ranges = Vec::new();
        for &(size, alignment) in &requests {
            let offset = cursor.allocate(size, alignment);
            assert_eq!(offset % alignment, 0, "offset {offset} not aligned to {alignment}");
            ranges.push(offset..offset + size);
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
            assert!(a.end <= cursor.capacity());
        }
    }

    #[test]
    fn allocation_may_fill_pool_exactly() {
        let mut cursor = BumpCursor::new(256);
        cursor.allocate(128, 16);
        assert_eq!(cursor.allocate(128, 128), 128);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "memory pool exhausted")]
    fn exceeding_capacity_panics() {
        let mut cursor = BumpCursor::new(256);
        cursor.allocate(200, 4);
        cursor.allocate(64, 64);
    }

    #[test]
    #[should_panic(expected = "memory pool exhausted")]
    fn alignment_padding_counts_against_capacity() {
        let mut cursor = BumpCursor::new(256);
        cursor.allocate(1, 1);
        // fits without padding, but not once aligned to 256
        cursor.allocate(200, 256);
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut cursor = BumpCursor::new(1024);
        cursor.allocate(512, 16);
        cursor.reset();
        assert_eq!(cursor.used(), 0);
        assert_eq!(cursor.allocate(16, 16), 0);
    }

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = property_flags;
        }
        props
    }

    #[test]
    fn memory_type_honours_bits_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b101, host), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, host), None);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn memory_types_past_count_are_ignored() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
