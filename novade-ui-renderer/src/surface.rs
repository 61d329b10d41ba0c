//! Presentation surface manager: swapchain, MSAA color target, render pass
//! and per-image framebuffers.
//!
//! The render pass depends only on the surface format and sample count, so
//! it is created once. Everything sized by the extent (swapchain, its views,
//! the MSAA image, framebuffers) is rebuilt together on resize.

use ash::extensions::khr::{Surface, Swapchain};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::device::GpuContext;
use crate::error::{RendererError, Result, Subsystem, VkResultExt};
use crate::memory::{color_subresource_range, DeviceImage, ImageDesc};

/// Picks a byte-order-matching 8-bit UNORM format in the sRGB non-linear
/// color space, falling back to the first advertised format.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            // the surface has no preference
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }
    PREFERRED
        .iter()
        .find_map(|&wanted| {
            formats
                .iter()
                .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when preferred and offered, otherwise FIFO (always available).
pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    prefer_mailbox: bool,
) -> vk::PresentModeKHR {
    if prefer_mailbox && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `min + 1`, clamped to `max` when the surface reports a maximum.
pub(crate) fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

pub(crate) fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub(crate) fn choose_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Highest of 4, 2, 1 samples that the device supports and `max_samples` allows.
pub(crate) fn choose_sample_count(
    supported: vk::SampleCountFlags,
    max_samples: u32,
) -> vk::SampleCountFlags {
    [
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
    ]
    .into_iter()
    .find(|&(count, flag)| count <= max_samples && supported.contains(flag))
    .map_or(vk::SampleCountFlags::TYPE_1, |(_, flag)| flag)
}

fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let present_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(if multisampled {
            vk::AttachmentLoadOp::DONT_CARE
        } else {
            vk::AttachmentLoadOp::CLEAR
        })
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let msaa_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let resolve_ref = [vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref);
    if multisampled {
        subpass = subpass.resolve_attachments(&resolve_ref);
    }
    let subpasses = [subpass.build()];

    let dependencies = [vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build()];

    let resolved = [msaa_attachment, present_attachment];
    let direct = [present_attachment];
    let attachments: &[vk::AttachmentDescription] = if multisampled { &resolved } else { &direct };

    let render_pass_create_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_create_info, None) }
        .in_subsystem(Subsystem::PresentationSurface, "vkCreateRenderPass")
}

/// Result of [`PresentationSurface::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was acquired.
    OutOfDate,
}

/// Extent-dependent objects, destroyed and recreated together.
struct SwapchainResources {
    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    msaa: Option<DeviceImage>,
}

pub struct PresentationSurface {
    device: Arc<ash::Device>,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    swapchain_loader: Swapchain,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    sample_count: vk::SampleCountFlags,
    render_pass: vk::RenderPass,
    resources: Option<SwapchainResources>,
}

impl PresentationSurface {
    /// Chooses format, present mode and sample count, creates the render pass
    /// and the first swapchain at `width`x`height` physical pixels.
    pub fn new(ctx: &GpuContext, config: &RendererConfig, width: u32, height: u32) -> Result<Self> {
        let target = ctx.presentation_target().ok_or(RendererError::Vulkan {
            subsystem: Subsystem::PresentationSurface,
            operation: "surface lookup (headless context)",
            result: vk::Result::ERROR_SURFACE_LOST_KHR,
        })?;
        let physical_device = ctx.physical_device();

        let formats = unsafe {
            target
                .loader
                .get_physical_device_surface_formats(physical_device, target.surface)
        }
        .in_subsystem(Subsystem::PresentationSurface, "vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let format = choose_surface_format(&formats).ok_or(RendererError::NoSurfaceFormat)?;

        let present_modes = unsafe {
            target
                .loader
                .get_physical_device_surface_present_modes(physical_device, target.surface)
        }
        .in_subsystem(Subsystem::PresentationSurface, "vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        let present_mode = choose_present_mode(&present_modes, config.prefer_mailbox);

        let sample_count = choose_sample_count(
            ctx.properties().limits.framebuffer_color_sample_counts,
            config.max_msaa_samples,
        );
        info!(
            "Surface format {:?}/{:?}, present mode {:?}, {:?} samples.",
            format.format, format.color_space, present_mode, sample_count
        );

        let device = Arc::clone(ctx.device());
        let render_pass = create_render_pass(&device, format.format, sample_count)?;

        let mut surface = Self {
            swapchain_loader: Swapchain::new(ctx.instance(), &device),
            device,
            physical_device,
            memory_properties: *ctx.memory_properties(),
            surface_loader: target.loader.clone(),
            surface: target.surface,
            format,
            present_mode,
            sample_count,
            render_pass,
            resources: None,
        };
        surface.rebuild(width, height)?;
        Ok(surface)
    }

    /// Recreates the swapchain, MSAA target and framebuffers at the given
    /// physical extent. The caller must ensure no submitted frame still uses
    /// the old resources.
    ///
    /// Returns `false` when the surface currently has a zero extent (e.g. a
    /// minimized window); the old resources are kept and a later call retries.
    pub fn rebuild(&mut self, width: u32, height: u32) -> Result<bool> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .in_subsystem(Subsystem::PresentationSurface, "vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let extent = choose_extent(&capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            debug!("Surface extent is zero, deferring swapchain rebuild.");
            return Ok(false);
        }

        let old = self.resources.take();
        let old_swapchain = old.as_ref().map_or(vk::SwapchainKHR::null(), |r| r.swapchain);

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(choose_image_count(&capabilities))
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(capabilities.supported_composite_alpha))
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let created =
            unsafe { self.swapchain_loader.create_swapchain(&swapchain_create_info, None) };
        // The retired swapchain is destroyed whether or not creation succeeded.
        if let Some(old) = old {
            self.destroy_resources(old);
        }
        let swapchain =
            created.in_subsystem(Subsystem::PresentationSurface, "vkCreateSwapchainKHR")?;

        let mut resources = SwapchainResources {
            swapchain,
            extent,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            msaa: None,
        };
        if let Err(err) = self.populate(&mut resources) {
            self.destroy_resources(resources);
            return Err(err);
        }

        info!(
            "Swapchain built: {}x{}, {} images.",
            extent.width,
            extent.height,
            resources.images.len()
        );
        self.resources = Some(resources);
        Ok(true)
    }

    fn populate(&self, resources: &mut SwapchainResources) -> Result<()> {
        let images = unsafe { self.swapchain_loader.get_swapchain_images(resources.swapchain) };
        resources.images =
            images.in_subsystem(Subsystem::PresentationSurface, "vkGetSwapchainImagesKHR")?;

        if self.sample_count != vk::SampleCountFlags::TYPE_1 {
            let desc = ImageDesc {
                format: self.format.format,
                extent: resources.extent,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                samples: self.sample_count,
                preferred_memory: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
            };
            resources.msaa = Some(DeviceImage::new(
                Arc::clone(&self.device),
                &self.memory_properties,
                &desc,
                Subsystem::PresentationSurface,
            )?);
        }

        for &image in &resources.images {
            let image_view_create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(color_subresource_range());
            let image_view = unsafe { self.device.create_image_view(&image_view_create_info, None) }
                .in_subsystem(Subsystem::PresentationSurface, "vkCreateImageView")?;
            resources.image_views.push(image_view);

            let fb_attachments: Vec<vk::ImageView> = match &resources.msaa {
                Some(msaa) => vec![msaa.view, image_view],
                None => vec![image_view],
            };
            let framebuffer_create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&fb_attachments)
                .width(resources.extent.width)
                .height(resources.extent.height)
                .layers(1);
            let framebuffer =
                unsafe { self.device.create_framebuffer(&framebuffer_create_info, None) }
                    .in_subsystem(Subsystem::PresentationSurface, "vkCreateFramebuffer")?;
            resources.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_resources(&self, resources: SwapchainResources) {
        unsafe {
            for &framebuffer in &resources.framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for &image_view in &resources.image_views {
                self.device.destroy_image_view(image_view, None);
            }
        }
        drop(resources.msaa);
        unsafe { self.swapchain_loader.destroy_swapchain(resources.swapchain, None) };
    }

    /// Acquires the next image, signalling `signal` when it is ready.
    pub fn acquire(&self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let Some(resources) = &self.resources else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        let acquired = unsafe {
            self.swapchain_loader
                .acquire_next_image(resources.swapchain, u64::MAX, signal, vk::Fence::null())
        };
        match acquired {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                warn!("Surface lost during acquire.");
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(result) => {
                Err(result).in_subsystem(Subsystem::PresentationSurface, "vkAcquireNextImageKHR")
            }
        }
    }

    /// Queues `image_index` for presentation after `wait`. Returns `true` when
    /// the swapchain should be rebuilt before the next frame.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let Some(resources) = &self.resources else {
            return Ok(true);
        };
        let wait_semaphores = [wait];
        let swapchains = [resources.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR) => Ok(true),
            Err(result) => {
                Err(result).in_subsystem(Subsystem::PresentationSurface, "vkQueuePresentKHR")
            }
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.sample_count
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Current swapchain extent, zero before the first successful build.
    pub fn extent(&self) -> vk::Extent2D {
        self.resources
            .as_ref()
            .map_or(vk::Extent2D::default(), |r| r.extent)
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.resources
            .as_ref()
            .map_or(vk::Framebuffer::null(), |r| r.framebuffers[image_index as usize])
    }

    pub fn image_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.images.len())
    }
}

impl Drop for PresentationSurface {
    fn drop(&mut self) {
        if let Some(resources) = self.resources.take() {
            self.destroy_resources(resources);
        }
        unsafe { self.device.destroy_render_pass(self.render_pass, None) };
        debug!("Presentation surface resources destroyed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::{PresentModeKHR as Mode, SampleCountFlags as Samples};
    use rstest::rstest;

    fn fmt(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn prefers_unorm_bgra_in_srgb_space() {
        let formats = [
            fmt(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            fmt(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
    }

    #[test]
    fn falls_back_to_first_advertised_format() {
        let formats = [fmt(
            vk::Format::A2B10G10R10_UNORM_PACK32,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn undefined_format_means_free_choice() {
        let formats = [fmt(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
    }

    #[rstest]
    #[case(&[Mode::FIFO], true, Mode::FIFO)]
    #[case(&[Mode::FIFO, Mode::MAILBOX], true, Mode::MAILBOX)]
    #[case(&[Mode::FIFO, Mode::MAILBOX], false, Mode::FIFO)]
    #[case(&[Mode::IMMEDIATE, Mode::FIFO], true, Mode::FIFO)]
    fn present_mode_selection(
        #[case] modes: &[vk::PresentModeKHR],
        #[case] prefer_mailbox: bool,
        #[case] expected: vk::PresentModeKHR,
    ) {
        assert_eq!(choose_present_mode(modes, prefer_mailbox), expected);
    }

    #[rstest]
    #[case(2, 0, 3)]
    #[case(2, 8, 3)]
    #[case(3, 3, 3)]
    #[case(1, 2, 2)]
    fn image_count_is_min_plus_one_clamped(
        #[case] min: u32,
        #[case] max: u32,
        #[case] expected: u32,
    ) {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), expected);
    }

    #[test]
    fn extent_follows_surface_unless_undefined() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(800, 600),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        };
        assert_eq!(choose_extent(&caps, 1920, 1080), extent(800, 600));

        caps.current_extent = extent(u32::MAX, u32::MAX);
        assert_eq!(choose_extent(&caps, 1920, 1080), extent(1920, 1080));
        assert_eq!(choose_extent(&caps, 9000, 0), extent(4096, 1));
    }

    #[rstest]
    #[case(
        Samples::TYPE_1 | Samples::TYPE_2 | Samples::TYPE_4 | Samples::TYPE_8,
        4,
        Samples::TYPE_4
    )]
    #[case(Samples::TYPE_1 | Samples::TYPE_2, 4, Samples::TYPE_2)]
    #[case(Samples::TYPE_1 | Samples::TYPE_4, 2, Samples::TYPE_1)]
    #[case(Samples::TYPE_1 | Samples::TYPE_4, 1, Samples::TYPE_1)]
    fn sample_count_is_highest_supported_within_limit(
        #[case] supported: vk::SampleCountFlags,
        #[case] max: u32,
        #[case] expected: vk::SampleCountFlags,
    ) {
        assert_eq!(choose_sample_count(supported, max), expected);
    }

    #[test]
    fn composite_alpha_prefers_opaque() {
        let all = vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED;
        assert_eq!(choose_composite_alpha(all), vk::CompositeAlphaFlagsKHR::OPAQUE);
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }
}
