//! Atlas streaming.
//!
//! Callers stage atlas changes with [`PendingUploads`]; during `render` the
//! coordinator turns them into at most one transfer per atlas kind:
//!
//! 1. A size change (or the first upload) recreates the atlas image. The
//!    other slots' fences are waited on first, then the descriptor sets of
//!    every slot are rewritten to the new view. The whole image is uploaded.
//! 2. Otherwise only the dirty rectangle is uploaded, or the whole image when
//!    no rectangle was given.
//! 3. Dirty rows are packed tightly into the current slot's staging lane.
//!    Lanes partition the staging buffer, so a slot only ever writes bytes the
//!    GPU finished reading when that slot's fence signaled.
//!
//! Lane space for every upload is reserved before any image is recreated.
//! An upload that does not fit in what is left of the lane stays staged and
//! is streamed by a later frame; one larger than a whole lane is dropped.
//!
//! The copies are recorded ahead of the render pass by
//! [`record_atlas_transfers`].

use ash::vk;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use crate::error::{RendererError, Result, Subsystem};
use crate::memory::{
    align_up, color_subresource_range, DeviceImage, ImageDesc, MemoryPool, PoolBuffer,
};
use crate::scene::DrawKind;
use crate::sync::{wait_others, SlotFences};
use crate::FRAMES_IN_FLIGHT;

/// Alignment of each record inside a lane. Covers `bufferOffset` rules for
/// every supported texel size.
pub const LANE_RECORD_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasKind {
    Glyph,
    Vector,
    Image,
}

impl AtlasKind {
    pub const ALL: [AtlasKind; 3] = [AtlasKind::Glyph, AtlasKind::Vector, AtlasKind::Image];

    pub const fn index(self) -> usize {
        match self {
            AtlasKind::Glyph => 0,
            AtlasKind::Vector => 1,
            AtlasKind::Image => 2,
        }
    }

    pub const fn format(self) -> vk::Format {
        match self {
            AtlasKind::Glyph => vk::Format::R8_UNORM,
            AtlasKind::Vector | AtlasKind::Image => vk::Format::R8G8B8A8_UNORM,
        }
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            AtlasKind::Glyph => 1,
            AtlasKind::Vector | AtlasKind::Image => 4,
        }
    }

    /// The draw kind that samples this atlas.
    pub const fn draw_kind(self) -> DrawKind {
        match self {
            AtlasKind::Glyph => DrawKind::Glyph,
            AtlasKind::Vector => DrawKind::Vector,
            AtlasKind::Image => DrawKind::Image,
        }
    }

    pub const fn for_draw_kind(kind: DrawKind) -> Option<AtlasKind> {
        match kind {
            DrawKind::Primitive => None,
            DrawKind::Glyph => Some(AtlasKind::Glyph),
            DrawKind::Vector => Some(AtlasKind::Vector),
            DrawKind::Image => Some(AtlasKind::Image),
        }
    }
}

/// Changed region of an atlas, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }

    pub fn byte_len(&self, bytes_per_pixel: u32) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(bytes_per_pixel)
    }
}

/// One staged atlas change. Borrows the caller's pixels until `render` returns.
#[derive(Debug, Clone, Copy)]
pub struct PendingUpload<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub dirty: Option<DirtyRect>,
}

/// Atlas changes staged for the next `render` call, at most one per kind.
/// Staging a kind again replaces the earlier request.
#[derive(Debug, Default)]
pub struct PendingUploads<'a> {
    slots: [Option<PendingUpload<'a>>; 3],
}

impl<'a> PendingUploads<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the whole `width`x`height` atlas of `kind`, with `dirty` naming
    /// the region that changed (`None` uploads everything).
    ///
    /// The update has to fit in one staging lane
    /// ([`crate::RendererConfig::staging_lane_bytes`]) or it is dropped
    /// during `render`.
    ///
    /// # Panics
    ///
    /// If either dimension is zero, if `data` is not exactly
    /// `width * height * bytes_per_pixel` bytes, or if `dirty` extends past
    /// the atlas.
    pub fn stage(
        &mut self,
        kind: AtlasKind,
        data: &'a [u8],
        width: u32,
        height: u32,
        dirty: Option<DirtyRect>,
    ) {
        assert!(
            width > 0 && height > 0,
            "{kind:?} atlas dimensions must be non-zero, got {width}x{height}"
        );
        let expected = u64::from(width) * u64::from(height) * u64::from(kind.bytes_per_pixel());
        assert_eq!(
            data.len() as u64,
            expected,
            "{kind:?} atlas {width}x{height} needs {expected} bytes, got {}",
            data.len()
        );
        if let Some(rect) = dirty {
            assert!(
                rect.fits_within(width, height),
                "{kind:?} dirty rect {rect:?} exceeds atlas {width}x{height}"
            );
        }
        self.slots[kind.index()] = Some(PendingUpload {
            data,
            width,
            height,
            dirty,
        });
    }

    pub fn stage_glyph_atlas(
        &mut self,
        data: &'a [u8],
        width: u32,
        height: u32,
        dirty: Option<DirtyRect>,
    ) {
        self.stage(AtlasKind::Glyph, data, width, height, dirty);
    }

    pub fn stage_vector_atlas(
        &mut self,
        data: &'a [u8],
        width: u32,
        height: u32,
        dirty: Option<DirtyRect>,
    ) {
        self.stage(AtlasKind::Vector, data, width, height, dirty);
    }

    pub fn stage_image_atlas(
        &mut self,
        data: &'a [u8],
        width: u32,
        height: u32,
        dirty: Option<DirtyRect>,
    ) {
        self.stage(AtlasKind::Image, data, width, height, dirty);
    }

    pub fn get(&self, kind: AtlasKind) -> Option<&PendingUpload<'a>> {
        self.slots[kind.index()].as_ref()
    }

    pub fn take(&mut self, kind: AtlasKind) -> Option<PendingUpload<'a>> {
        self.slots[kind.index()].take()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.slots = [None; 3];
    }
}

/// One queued buffer-to-image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasTransferRecord {
    pub kind: AtlasKind,
    pub image: vk::Image,
    /// Absolute offset into the staging buffer.
    pub staging_offset: vk::DeviceSize,
    pub rect: DirtyRect,
    /// Keep texels outside `rect` (image already holds valid contents).
    pub preserve_contents: bool,
}

/// Transfers for one frame, one per atlas kind at most.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferList {
    records: [Option<AtlasTransferRecord>; 3],
    len: usize,
}

impl TransferList {
    pub const CAPACITY: usize = 3;

    /// # Panics
    ///
    /// If the list already holds [`Self::CAPACITY`] records. With one record
    /// per atlas kind this cannot happen.
    pub fn push(&mut self, record: AtlasTransferRecord) {
        assert!(
            self.len < Self::CAPACITY,
            "atlas transfer list full: {} records already queued",
            self.len
        );
        self.records[self.len] = Some(record);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &AtlasTransferRecord> {
        self.records[..self.len].iter().flatten()
    }
}

/// Static partition of the staging buffer into one lane per frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingLanes {
    lane_size: u64,
    lane_count: usize,
}

impl StagingLanes {
    pub fn new(lane_size: u64, lane_count: usize) -> Self {
        assert!(
            lane_size % LANE_RECORD_ALIGNMENT == 0,
            "lane size {lane_size} is not 16-byte aligned"
        );
        Self {
            lane_size,
            lane_count,
        }
    }

    pub fn lane_size(&self) -> u64 {
        self.lane_size
    }

    pub fn total_size(&self) -> u64 {
        self.lane_size * self.lane_count as u64
    }

    /// Byte range reserved for `slot`.
    pub fn lane_range(&self, slot: usize) -> Range<u64> {
        assert!(slot < self.lane_count, "slot {slot} out of range");
        let start = self.lane_size * slot as u64;
        start..start + self.lane_size
    }

    pub fn cursor(&self, slot: usize) -> LaneCursor {
        let range = self.lane_range(slot);
        LaneCursor {
            start: range.start,
            end: range.end,
            next: range.start,
        }
    }
}

/// Sequential allocator inside one lane for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneCursor {
    start: u64,
    end: u64,
    next: u64,
}

impl LaneCursor {
    /// Reserves `len` bytes and returns their absolute staging offset, or
    /// `None` when the rest of the lane is too small.
    pub fn try_reserve(&mut self, len: u64) -> Option<u64> {
        let offset = align_up(self.next, LANE_RECORD_ALIGNMENT);
        let end = offset.checked_add(len).filter(|&end| end <= self.end)?;
        self.next = end;
        Some(offset)
    }

    /// Like [`Self::try_reserve`].
    ///
    /// # Panics
    ///
    /// If the lane cannot hold `len` more bytes.
    pub fn reserve(&mut self, len: u64) -> u64 {
        let next = self.next;
        match self.try_reserve(len) {
            Some(offset) => offset,
            None => panic!(
                "staging lane overflow: {} bytes after {} exceed lane {}..{}",
                len, next, self.start, self.end
            ),
        }
    }

    /// Size of the whole lane.
    pub fn capacity(&self) -> u64 {
        self.end - self.start
    }

    pub fn used(&self) -> u64 {
        self.next - self.start
    }
}

/// Copies the rows of `rect` out of a tightly packed atlas of `atlas_width`
/// texels into `dst`, also tightly packed.
pub fn pack_dirty_rows(
    src: &[u8],
    atlas_width: u32,
    bytes_per_pixel: u32,
    rect: DirtyRect,
    dst: &mut [u8],
) {
    let bpp = bytes_per_pixel as usize;
    let src_stride = atlas_width as usize * bpp;
    let row_len = rect.width as usize * bpp;
    debug_assert_eq!(dst.len(), row_len * rect.height as usize);

    for (row, out) in dst.chunks_exact_mut(row_len).enumerate() {
        let start = (rect.y as usize + row) * src_stride + rect.x as usize * bpp;
        out.copy_from_slice(&src[start..start + row_len]);
    }
}

/// What to do with a staged upload given the atlas's current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadPlan {
    /// Size changed or no image yet: recreate, upload everything.
    Recreate,
    /// Upload the whole image into the existing one.
    Full,
    Partial(DirtyRect),
    /// Empty dirty rectangle.
    Skip,
}

pub(crate) fn plan_upload(
    current: Option<vk::Extent2D>,
    upload: &PendingUpload<'_>,
) -> UploadPlan {
    match current {
        Some(extent) if extent.width == upload.width && extent.height == upload.height => {
            match upload.dirty {
                None => UploadPlan::Full,
                Some(rect) if rect.is_empty() => UploadPlan::Skip,
                Some(rect) if rect == DirtyRect::full(upload.width, upload.height) => {
                    UploadPlan::Full
                }
                Some(rect) => UploadPlan::Partial(rect),
            }
        }
        _ => UploadPlan::Recreate,
    }
}

/// An upload accepted for this frame, with its lane bytes reserved.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmittedUpload<'a> {
    pub upload: PendingUpload<'a>,
    pub plan: UploadPlan,
    pub rect: DirtyRect,
    pub staging_offset: u64,
}

/// Takes from `uploads` every change that fits in the rest of `lane`, indexed
/// by [`AtlasKind::index`]. `extents` are the current atlas sizes.
///
/// Uploads that do not fit are left staged. An upload larger than the whole
/// lane can never be streamed and is dropped.
pub(crate) fn admit_uploads<'a>(
    uploads: &mut PendingUploads<'a>,
    extents: [Option<vk::Extent2D>; 3],
    lane: &mut LaneCursor,
) -> [Option<AdmittedUpload<'a>>; 3] {
    let mut admitted = [None; 3];
    for kind in AtlasKind::ALL {
        let Some(upload) = uploads.get(kind).copied() else {
            continue;
        };
        let plan = plan_upload(extents[kind.index()], &upload);
        let rect = match plan {
            UploadPlan::Skip => {
                trace!("{:?} atlas upload has an empty dirty rect.", kind);
                uploads.take(kind);
                continue;
            }
            UploadPlan::Recreate | UploadPlan::Full => DirtyRect::full(upload.width, upload.height),
            UploadPlan::Partial(rect) => rect,
        };
        let len = rect.byte_len(kind.bytes_per_pixel());
        if len > lane.capacity() {
            error!(
                "{:?} atlas upload of {} bytes exceeds the {} byte staging lane; dropped.",
                kind,
                len,
                lane.capacity()
            );
            uploads.take(kind);
            continue;
        }
        let Some(staging_offset) = lane.try_reserve(len) else {
            debug!(
                "{:?} atlas upload of {} bytes deferred, lane has {} bytes used.",
                kind,
                len,
                lane.used()
            );
            continue;
        };
        uploads.take(kind);
        admitted[kind.index()] = Some(AdmittedUpload {
            upload,
            plan,
            rect,
            staging_offset,
        });
    }
    admitted
}

/// Replaces a resource every slot's descriptors may reference.
///
/// Waits on every slot except `current` (whose fence the caller already
/// waited on), retires the old resource, creates the new one and calls
/// `rewrite` once per slot with it.
pub(crate) fn recreate_and_rebind<T>(
    fences: &dyn SlotFences,
    current: usize,
    retire: impl FnOnce(),
    create: impl FnOnce() -> Result<T>,
    mut rewrite: impl FnMut(usize, &T),
) -> Result<T> {
    wait_others(fences, current)?;
    retire();
    let created = create()?;
    for slot in 0..fences.slot_count() {
        rewrite(slot, &created);
    }
    Ok(created)
}

/// Atlas image plus the number of times this kind has been (re)created.
pub struct AtlasImage {
    pub image: DeviceImage,
    pub generation: u64,
}

/// Owns the three atlas images and the staging buffer.
pub struct AtlasStreamer {
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    atlases: [Option<AtlasImage>; 3],
    generations: [u64; 3],
    staging: PoolBuffer,
    lanes: StagingLanes,
    recreations: u64,
    uploads: u64,
}

impl AtlasStreamer {
    /// Carves `lane_bytes * FRAMES_IN_FLIGHT` bytes of staging out of `pool`,
    /// which must be host-visible.
    pub fn new(
        device: Arc<ash::Device>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        pool: &mut MemoryPool,
        lane_bytes: u64,
    ) -> Result<Self> {
        if !pool.is_mapped() {
            return Err(RendererError::NoSuitableMemoryType {
                subsystem: Subsystem::AtlasStreaming,
                required: vk::MemoryPropertyFlags::HOST_VISIBLE,
            });
        }
        let lanes = StagingLanes::new(lane_bytes, FRAMES_IN_FLIGHT);
        let staging = pool.create_buffer(lanes.total_size(), vk::BufferUsageFlags::TRANSFER_SRC)?;
        debug!(
            "Atlas staging buffer: {} lanes of {} bytes.",
            FRAMES_IN_FLIGHT,
            lanes.lane_size()
        );
        Ok(Self {
            device,
            memory_properties,
            atlases: [None, None, None],
            generations: [0; 3],
            staging,
            lanes,
            recreations: 0,
            uploads: 0,
        })
    }

    pub fn staging_buffer(&self) -> vk::Buffer {
        self.staging.handle()
    }

    pub fn lanes(&self) -> StagingLanes {
        self.lanes
    }

    pub fn atlas(&self, kind: AtlasKind) -> Option<&AtlasImage> {
        self.atlases[kind.index()].as_ref()
    }

    pub fn extent(&self, kind: AtlasKind) -> Option<vk::Extent2D> {
        self.atlas(kind).map(|atlas| atlas.image.extent)
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Consumes the staged uploads for this frame and fills `slot`'s lane.
    ///
    /// The caller must have waited on `slot`'s fence. `rebind` is invoked for
    /// every slot with the new view whenever an atlas is recreated.
    pub fn stream(
        &mut self,
        slot: usize,
        uploads: &mut PendingUploads<'_>,
        fences: &dyn SlotFences,
        mut rebind: impl FnMut(usize, AtlasKind, vk::ImageView),
    ) -> Result<TransferList> {
        let mut transfers = TransferList::default();
        let mut lane = self.lanes.cursor(slot);
        let extents = AtlasKind::ALL.map(|kind| self.extent(kind));
        let admitted = admit_uploads(uploads, extents, &mut lane);

        for (kind, entry) in AtlasKind::ALL.into_iter().zip(admitted) {
            let Some(AdmittedUpload {
                upload,
                plan,
                rect,
                staging_offset,
            }) = entry
            else {
                continue;
            };
            let preserve_contents = matches!(plan, UploadPlan::Partial(_));
            if plan == UploadPlan::Recreate {
                let index = kind.index();
                let device = Arc::clone(&self.device);
                let memory_properties = self.memory_properties;
                let atlases = &mut self.atlases;
                let image = recreate_and_rebind(
                    fences,
                    slot,
                    || atlases[index] = None,
                    || {
                        create_atlas_image(
                            device,
                            &memory_properties,
                            kind,
                            upload.width,
                            upload.height,
                        )
                    },
                    |target, image: &DeviceImage| rebind(target, kind, image.view),
                )?;
                self.generations[index] += 1;
                self.recreations += 1;
                info!(
                    "{:?} atlas recreated at {}x{} (generation {}).",
                    kind, upload.width, upload.height, self.generations[index]
                );
                self.atlases[index] = Some(AtlasImage {
                    image,
                    generation: self.generations[index],
                });
            }

            let Some(atlas) = self.atlases[kind.index()].as_ref() else {
                continue;
            };
            let image = atlas.image.image;
            let staging = self.staging.bytes_mut().ok_or(RendererError::NoSuitableMemoryType {
                subsystem: Subsystem::AtlasStreaming,
                required: vk::MemoryPropertyFlags::HOST_VISIBLE,
            })?;
            write_staged(staging, staging_offset, &upload, kind.bytes_per_pixel(), rect);

            transfers.push(AtlasTransferRecord {
                kind,
                image,
                staging_offset,
                rect,
                preserve_contents,
            });
            self.uploads += 1;
            trace!(
                "{:?} atlas: {}x{} at ({}, {}) staged at offset {}.",
                kind,
                rect.width,
                rect.height,
                rect.x,
                rect.y,
                staging_offset
            );
        }
        Ok(transfers)
    }
}

fn create_atlas_image(
    device: Arc<ash::Device>,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    kind: AtlasKind,
    width: u32,
    height: u32,
) -> Result<DeviceImage> {
    let desc = ImageDesc {
        format: kind.format(),
        extent: vk::Extent2D { width, height },
        // TRANSFER_SRC allows readback
        usage: vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC,
        samples: vk::SampleCountFlags::TYPE_1,
        preferred_memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
    };
    DeviceImage::new(device, memory_properties, &desc, Subsystem::AtlasStreaming)
}

/// Packs `rect` of `upload` into `staging` at the reserved `offset`.
pub(crate) fn write_staged(
    staging: &mut [u8],
    offset: u64,
    upload: &PendingUpload<'_>,
    bytes_per_pixel: u32,
    rect: DirtyRect,
) {
    let len = rect.byte_len(bytes_per_pixel);
    let dst = &mut staging[offset as usize..(offset + len) as usize];
    pack_dirty_rows(upload.data, upload.width, bytes_per_pixel, rect, dst);
}

/// Records layout transitions and copies for `transfers`, to be placed before
/// the render pass that samples the atlases.
pub fn record_atlas_transfers(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    staging_buffer: vk::Buffer,
    transfers: &TransferList,
) {
    for record in transfers.iter() {
        let old_layout = if record.preserve_contents {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        // Earlier submissions may still be sampling the image.
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(record.image)
            .subresource_range(color_subresource_range())
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .build();

        let copy_region = vk::BufferImageCopy::builder()
            .buffer_offset(record.staging_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D {
                x: record.rect.x as i32,
                y: record.rect.y as i32,
                z: 0,
            })
            .image_extent(vk::Extent3D {
                width: record.rect.width,
                height: record.rect.height,
                depth: 1,
            })
            .build();

        let to_shader_read = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(record.image)
            .subresource_range(color_subresource_range())
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build();

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging_buffer,
                record.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region],
            );
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader_read],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::RecordingFences;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::cell::RefCell;

    fn upload(
        data: &[u8],
        width: u32,
        height: u32,
        dirty: Option<DirtyRect>,
    ) -> PendingUpload<'_> {
        PendingUpload {
            data,
            width,
            height,
            dirty,
        }
    }

    fn extent(width: u32, height: u32) -> Option<vk::Extent2D> {
        Some(vk::Extent2D { width, height })
    }

    #[test]
    fn atlas_formats_match_bytes_per_pixel() {
        assert_eq!(AtlasKind::Glyph.format(), vk::Format::R8_UNORM);
        assert_eq!(AtlasKind::Glyph.bytes_per_pixel(), 1);
        assert_eq!(AtlasKind::Vector.bytes_per_pixel(), 4);
        assert_eq!(AtlasKind::Image.format(), vk::Format::R8G8B8A8_UNORM);
        for kind in AtlasKind::ALL {
            assert_eq!(AtlasKind::for_draw_kind(kind.draw_kind()), Some(kind));
        }
    }

    #[test]
    fn staging_again_overwrites_previous_request() {
        let first = [0u8; 16];
        let second = [1u8; 64];
        let mut uploads = PendingUploads::new();
        uploads.stage_glyph_atlas(&first, 4, 4, None);
        uploads.stage_glyph_atlas(&second, 8, 8, Some(DirtyRect::new(0, 0, 2, 2)));
        let staged = uploads.get(AtlasKind::Glyph).unwrap();
        assert_eq!(staged.width, 8);
        assert_eq!(staged.data.len(), 64);
        assert!(uploads.get(AtlasKind::Vector).is_none());

        assert!(uploads.take(AtlasKind::Glyph).is_some());
        assert!(uploads.is_empty());
    }

    #[test]
    #[should_panic(expected = "needs 64 bytes")]
    fn staged_bytes_must_match_dimensions() {
        let rgba = [0u8; 16];
        PendingUploads::new().stage_vector_atlas(&rgba, 4, 4, None);
    }

    #[test]
    #[should_panic(expected = "exceeds atlas")]
    fn dirty_rect_must_fit_atlas() {
        let bytes = [0u8; 16];
        PendingUploads::new().stage_glyph_atlas(&bytes, 4, 4, Some(DirtyRect::new(2, 2, 3, 1)));
    }

    #[rstest]
    #[case(0, 0)]
    #[case(0, 16)]
    #[case(16, 0)]
    #[should_panic(expected = "dimensions must be non-zero")]
    fn zero_sized_atlas_is_rejected_when_staged(#[case] width: u32, #[case] height: u32) {
        PendingUploads::new().stage_image_atlas(&[], width, height, None);
    }

    #[test]
    fn plan_recreates_on_first_upload_and_size_change() {
        let bytes = [0u8; 64];
        let same = upload(&bytes, 8, 8, Some(DirtyRect::new(1, 1, 2, 2)));
        assert_eq!(plan_upload(None, &same), UploadPlan::Recreate);
        assert_eq!(
            plan_upload(extent(4, 16), &same),
            UploadPlan::Recreate
        );
        let current = extent(8, 8);
        assert_eq!(plan_upload(current, &same), UploadPlan::Partial(DirtyRect::new(1, 1, 2, 2)));
        assert_eq!(plan_upload(current, &upload(&bytes, 8, 8, None)), UploadPlan::Full);
        assert_eq!(
            plan_upload(current, &upload(&bytes, 8, 8, Some(DirtyRect::full(8, 8)))),
            UploadPlan::Full
        );
        assert_eq!(
            plan_upload(current, &upload(&bytes, 8, 8, Some(DirtyRect::new(3, 3, 0, 5)))),
            UploadPlan::Skip
        );
    }

    #[test]
    fn pack_dirty_rows_strips_atlas_stride() {
        // 4x3 RGBA atlas, texel value = index
        let atlas: Vec<u8> = (0..4 * 3 * 4).map(|i| i as u8).collect();
        let rect = DirtyRect::new(1, 1, 2, 2);
        let mut packed = vec![0u8; rect.byte_len(4) as usize];
        pack_dirty_rows(&atlas, 4, 4, rect, &mut packed);
        let expected: Vec<u8> = [20u8..28, 36..44].into_iter().flatten().collect();
        assert_eq!(packed, expected);
    }

    #[test]
    fn lanes_never_overlap() {
        let lanes = StagingLanes::new(1024, FRAMES_IN_FLIGHT);
        for i in 0..FRAMES_IN_FLIGHT {
            for j in (0..FRAMES_IN_FLIGHT).filter(|&j| j != i) {
                let (a, b) = (lanes.lane_range(i), lanes.lane_range(j));
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(lanes.total_size(), 1024 * FRAMES_IN_FLIGHT as u64);
    }

    #[test]
    fn staging_writes_stay_inside_the_slot_lane() {
        const SENTINEL: u8 = 0xee;
        let lanes = StagingLanes::new(256, FRAMES_IN_FLIGHT);
        let glyphs = vec![1u8; 16 * 8];
        let icons = vec![2u8; 4 * 4 * 4];
        let images = vec![3u8; 2 * 3 * 4];

        for slot in 0..FRAMES_IN_FLIGHT {
            let mut staging = vec![SENTINEL; lanes.total_size() as usize];
            let mut lane = lanes.cursor(slot);
            let staged = [
                (upload(&glyphs, 16, 8, Some(DirtyRect::new(3, 1, 7, 5))), 1),
                (upload(&icons, 4, 4, None), 4),
                (upload(&images, 2, 3, None), 4),
            ];
            for (pending, bpp) in &staged {
                let rect = pending
                    .dirty
                    .unwrap_or(DirtyRect::full(pending.width, pending.height));
                let offset = lane.reserve(rect.byte_len(*bpp));
                write_staged(&mut staging, offset, pending, *bpp, rect);
                assert_eq!(offset % LANE_RECORD_ALIGNMENT, 0);
            }

            let range = lanes.lane_range(slot);
            for (index, &byte) in staging.iter().enumerate() {
                if !range.contains(&(index as u64)) {
                    assert_eq!(byte, SENTINEL, "slot {slot} wrote outside its lane at {index}");
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "staging lane overflow")]
    fn lane_overflow_is_asserted() {
        let lanes = StagingLanes::new(64, FRAMES_IN_FLIGHT);
        let mut lane = lanes.cursor(1);
        lane.reserve(48);
        lane.reserve(17);
    }

    #[test]
    fn failed_reservation_leaves_the_cursor_unchanged() {
        let lanes = StagingLanes::new(64, FRAMES_IN_FLIGHT);
        let mut lane = lanes.cursor(2);
        assert_eq!(lane.try_reserve(40), Some(128));
        assert_eq!(lane.try_reserve(17), None);
        assert_eq!(lane.used(), 40);
        assert_eq!(lane.try_reserve(16), Some(128 + 48));
        assert_eq!(lane.capacity(), 64);
    }

    fn full_atlas(kind: AtlasKind, side: u32) -> Vec<u8> {
        vec![0u8; (side * side * kind.bytes_per_pixel()) as usize]
    }

    #[test]
    fn large_first_uploads_spread_over_frames_on_the_default_lane() {
        const SIDE: u32 = 2048;
        let lanes = StagingLanes::new(
            crate::RendererConfig::default().staging_lane_bytes,
            FRAMES_IN_FLIGHT,
        );
        let glyphs = full_atlas(AtlasKind::Glyph, SIDE);
        let vectors = full_atlas(AtlasKind::Vector, SIDE);
        let images = full_atlas(AtlasKind::Image, SIDE);
        let mut uploads = PendingUploads::new();
        uploads.stage_glyph_atlas(&glyphs, SIDE, SIDE, None);
        uploads.stage_vector_atlas(&vectors, SIDE, SIDE, None);
        uploads.stage_image_atlas(&images, SIDE, SIDE, None);

        let mut extents = [None; 3];
        let mut admitted_per_frame = Vec::new();
        for slot in 0..FRAMES_IN_FLIGHT {
            let mut lane = lanes.cursor(slot);
            let admitted = admit_uploads(&mut uploads, extents, &mut lane);
            let mut kinds = Vec::new();
            for (kind, entry) in AtlasKind::ALL.into_iter().zip(admitted) {
                let Some(entry) = entry else { continue };
                assert_eq!(entry.plan, UploadPlan::Recreate);
                let range = lanes.lane_range(slot);
                assert!(range.start <= entry.staging_offset);
                let len = entry.rect.byte_len(kind.bytes_per_pixel());
                assert!(entry.staging_offset + len <= range.end);
                extents[kind.index()] = extent(SIDE, SIDE);
                kinds.push(kind);
            }
            admitted_per_frame.push(kinds);
        }

        assert_eq!(
            admitted_per_frame,
            vec![
                vec![AtlasKind::Glyph],
                vec![AtlasKind::Vector],
                vec![AtlasKind::Image],
            ]
        );
        assert!(uploads.is_empty());
    }

    #[test]
    fn deferred_upload_stays_staged_untouched() {
        let lanes = StagingLanes::new(64, FRAMES_IN_FLIGHT);
        let glyphs = [7u8; 48];
        let icons = [9u8; 32];
        let mut uploads = PendingUploads::new();
        uploads.stage_glyph_atlas(&glyphs, 8, 6, None);
        uploads.stage_vector_atlas(&icons, 4, 2, Some(DirtyRect::new(1, 0, 2, 2)));

        let mut lane = lanes.cursor(0);
        let current = extent(4, 2);
        let admitted = admit_uploads(&mut uploads, [None, current, None], &mut lane);

        assert!(admitted[AtlasKind::Glyph.index()].is_some());
        assert!(admitted[AtlasKind::Vector.index()].is_none());
        let left = uploads.get(AtlasKind::Vector).copied().unwrap();
        assert_eq!(left.dirty, Some(DirtyRect::new(1, 0, 2, 2)));
        assert_eq!(left.data.len(), 32);
        assert!(uploads.get(AtlasKind::Glyph).is_none());
    }

    #[test]
    fn upload_larger_than_a_lane_is_dropped() {
        let lanes = StagingLanes::new(64, FRAMES_IN_FLIGHT);
        let glyphs = [0u8; 128];
        let icons = [0u8; 16];
        let mut uploads = PendingUploads::new();
        uploads.stage_glyph_atlas(&glyphs, 16, 8, None);
        uploads.stage_vector_atlas(&icons, 2, 2, None);

        let mut lane = lanes.cursor(0);
        let admitted = admit_uploads(&mut uploads, [None; 3], &mut lane);

        assert!(admitted[AtlasKind::Glyph.index()].is_none());
        let vector = admitted[AtlasKind::Vector.index()].unwrap();
        assert_eq!(vector.staging_offset, 0);
        assert!(uploads.is_empty());
    }

    #[test]
    fn empty_dirty_rect_is_consumed_without_lane_space() {
        let lanes = StagingLanes::new(64, FRAMES_IN_FLIGHT);
        let glyphs = [0u8; 16];
        let mut uploads = PendingUploads::new();
        uploads.stage_glyph_atlas(&glyphs, 4, 4, Some(DirtyRect::new(0, 0, 0, 4)));

        let mut lane = lanes.cursor(1);
        let current = extent(4, 4);
        let admitted = admit_uploads(&mut uploads, [current, None, None], &mut lane);

        assert!(admitted.iter().all(Option::is_none));
        assert!(uploads.is_empty());
        assert_eq!(lane.used(), 0);
    }

    fn record(kind: AtlasKind) -> AtlasTransferRecord {
        AtlasTransferRecord {
            kind,
            image: vk::Image::null(),
            staging_offset: 0,
            rect: DirtyRect::full(1, 1),
            preserve_contents: false,
        }
    }

    #[test]
    fn transfer_list_holds_one_record_per_kind() {
        let mut list = TransferList::default();
        for kind in AtlasKind::ALL {
            list.push(record(kind));
        }
        assert_eq!(list.len(), 3);
        let kinds: Vec<AtlasKind> = list.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, AtlasKind::ALL.to_vec());
    }

    #[test]
    #[should_panic(expected = "atlas transfer list full")]
    fn fourth_transfer_is_asserted() {
        let mut list = TransferList::default();
        for kind in AtlasKind::ALL {
            list.push(record(kind));
        }
        list.push(record(AtlasKind::Glyph));
    }

    /// Applies a transfer the way vkCmdCopyBufferToImage would.
    fn apply_copy(
        image: &mut [u8],
        image_width: u32,
        bpp: u32,
        staging: &[u8],
        record: &AtlasTransferRecord,
    ) {
        let row_len = (record.rect.width * bpp) as usize;
        let (x, y) = (record.rect.x as usize, record.rect.y as usize);
        for row in 0..record.rect.height as usize {
            let src = record.staging_offset as usize + row * row_len;
            let dst = ((y + row) * image_width as usize + x) * bpp as usize;
            image[dst..dst + row_len].copy_from_slice(&staging[src..src + row_len]);
        }
    }

    #[test]
    fn full_then_partial_upload_matches_cpu_composite() {
        let (width, height) = (8u32, 6u32);
        let lanes = StagingLanes::new(512, FRAMES_IN_FLIGHT);
        let mut staging = vec![0u8; lanes.total_size() as usize];
        let mut gpu_image = vec![0u8; (width * height * 4) as usize];

        let first: Vec<u8> = (0..width * height * 4).map(|i| (i % 251) as u8).collect();
        let mut second = first.clone();
        let dirty = DirtyRect::new(2, 1, 3, 4);
        for y in dirty.y..dirty.y + dirty.height {
            for x in dirty.x..dirty.x + dirty.width {
                let at = ((y * width + x) * 4) as usize;
                second[at..at + 4].copy_from_slice(&[0xff, 0x00, 0x80, 0xff]);
            }
        }
        // pixels outside the dirty rect that the second upload must not touch
        second[0] = 0x11;

        for (slot, (data, dirty, rect)) in [
            (&first, None, DirtyRect::full(width, height)),
            (&second, Some(dirty), dirty),
        ]
        .into_iter()
        .enumerate()
        {
            let mut lane = lanes.cursor(slot);
            let pending = upload(data, width, height, dirty);
            let offset = lane.reserve(rect.byte_len(4));
            write_staged(&mut staging, offset, &pending, 4, rect);
            let transfer = AtlasTransferRecord {
                kind: AtlasKind::Image,
                image: vk::Image::null(),
                staging_offset: offset,
                rect,
                preserve_contents: dirty.is_some(),
            };
            apply_copy(&mut gpu_image, width, 4, &staging, &transfer);
        }

        let mut expected = first.clone();
        for y in dirty.y..dirty.y + dirty.height {
            let start = ((y * width + dirty.x) * 4) as usize;
            let end = start + (dirty.width * 4) as usize;
            expected[start..end].copy_from_slice(&second[start..end]);
        }
        assert_eq!(gpu_image, expected);
        assert_ne!(gpu_image[0], 0x11);
    }

    #[test]
    fn recreation_waits_on_in_flight_slots_before_rebinding_all() {
        let fences = RecordingFences::new(&[false, true, false]);
        let log = RefCell::new(Vec::<String>::new());

        let view = recreate_and_rebind(
            &fences,
            1,
            || {
                let waited = fences.waits.borrow().clone();
                log.borrow_mut().push(format!("retire after waits {waited:?}"));
            },
            || Ok(42u32),
            |slot, view: &u32| {
                assert!(fences.is_signaled(slot).unwrap(), "slot {slot} still in flight");
                log.borrow_mut().push(format!("rewrite slot {slot} -> {view}"));
            },
        )
        .unwrap();

        assert_eq!(view, 42);
        assert_eq!(*fences.waits.borrow(), vec![0, 2]);
        assert_eq!(
            *log.borrow(),
            vec![
                "retire after waits [0, 2]".to_string(),
                "rewrite slot 0 -> 42".to_string(),
                "rewrite slot 1 -> 42".to_string(),
                "rewrite slot 2 -> 42".to_string(),
            ]
        );
    }

    #[test]
    fn failed_creation_rewrites_nothing() {
        let fences = RecordingFences::new(&[true, true, true]);
        let mut rewrites = 0;
        let result: Result<u32> = recreate_and_rebind(
            &fences,
            0,
            || {},
            || Err(RendererError::NoSuitableDevice),
            |_, _| rewrites += 1,
        );
        assert!(result.is_err());
        assert_eq!(rewrites, 0);
    }
}
