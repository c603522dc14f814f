// Render targets - depth/color attachments and framebuffers
//
// Everything here is sized to the swapchain and torn down/rebuilt on every
// recreation. The render pass itself depends only on format and sample count,
// so the renderer creates it once and passes it in.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{DeviceContext, Swapchain};

/// Depth formats in preference order.
pub fn depth_format_candidates() -> [vk::Format; 3] {
    [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
    ]
}

/// First candidate format supporting `features` under optimal tiling.
/// No supported format is fatal: attachments cannot be created at all.
pub fn find_supported_format(
    device: &DeviceContext,
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
) -> Result<vk::Format> {
    for &format in candidates {
        let props = unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical_device, format)
        };
        if props.optimal_tiling_features.contains(features) {
            return Ok(format);
        }
    }

    anyhow::bail!("No supported format among {:?}", candidates)
}

/// GPU-local image + memory + view, released in reverse order on drop.
pub struct DeviceImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<DeviceContext>,
}

impl DeviceImage {
    pub fn new(
        device: Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
        usage: vk::ImageUsageFlags,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "device-image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .device
                .create_image_view(&view_info, None)
                .context("Failed to create image view")?
        };

        Ok(Self {
            image,
            view,
            allocation: Some(allocation),
            device,
        })
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator().lock().free(allocation);
        }
    }
}

/// Build the render pass the renderer reuses across swapchain recreations.
///
/// With multisampling the attachment set is [msaa color, depth, resolve];
/// single-sampled it collapses to [color, depth] with the color attachment
/// presenting directly.
pub fn create_render_pass(
    device: &DeviceContext,
    color_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let depth_format = find_supported_format(
        device,
        &depth_format_candidates(),
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    )?;

    let msaa = samples != vk::SampleCountFlags::TYPE_1;

    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(if msaa {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        })
        .build();

    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let resolve_attachment_ref = vk::AttachmentReference::builder()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let mut attachments = vec![color_attachment, depth_attachment];

    let color_attachments = [color_attachment_ref];
    let resolve_attachments = [resolve_attachment_ref];

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref);

    if msaa {
        // The single-sampled resolve target is what gets presented
        let resolve_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();
        attachments.push(resolve_attachment);
        subpass = subpass.resolve_attachments(&resolve_attachments);
    }

    let subpasses = [subpass.build()];

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Swapchain-sized attachments plus one framebuffer per swapchain image.
pub struct RenderTargets {
    pub framebuffers: Vec<vk::Framebuffer>,
    depth: DeviceImage,
    /// Present only when multisampling; resolves into the swapchain image.
    msaa_color: Option<DeviceImage>,
    device: Arc<DeviceContext>,
}

impl RenderTargets {
    pub fn new(
        device: Arc<DeviceContext>,
        swapchain: &Swapchain,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let depth_format = find_supported_format(
            &device,
            &depth_format_candidates(),
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let depth = DeviceImage::new(
            device.clone(),
            swapchain.extent,
            depth_format,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples,
        )?;

        let msaa = samples != vk::SampleCountFlags::TYPE_1;
        let msaa_color = if msaa {
            Some(DeviceImage::new(
                device.clone(),
                swapchain.extent,
                swapchain.format,
                vk::ImageAspectFlags::COLOR,
                vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                samples,
            )?)
        } else {
            None
        };

        let framebuffers: Result<Vec<_>> = swapchain
            .image_views
            .iter()
            .map(|&swapchain_view| {
                let attachments: Vec<vk::ImageView> = match &msaa_color {
                    Some(color) => vec![color.view, depth.view, swapchain_view],
                    None => vec![swapchain_view, depth.view],
                };

                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(swapchain.extent.width)
                    .height(swapchain.extent.height)
                    .layers(1);

                unsafe {
                    device
                        .device
                        .create_framebuffer(&framebuffer_info, None)
                        .context("Failed to create framebuffer")
                }
            })
            .collect();
        let framebuffers = framebuffers?;

        log::info!("Created {} framebuffers", framebuffers.len());

        Ok(Self {
            framebuffers,
            depth,
            msaa_color,
            device,
        })
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }
}

impl Drop for RenderTargets {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
        }
        // depth / msaa_color images release themselves after the framebuffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_candidates_prefer_pure_depth() {
        let candidates = depth_format_candidates();
        assert_eq!(candidates[0], vk::Format::D32_SFLOAT);
        assert!(candidates.contains(&vk::Format::D24_UNORM_S8_UINT));
    }
}
