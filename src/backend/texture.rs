// Sampled textures
//
// RGBA8 pixels are uploaded through a staging buffer on the transient pool,
// transitioned into shader-readable layout, and bound as a combined image
// sampler. Texture bindings never consume dynamic-offset slots.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::buffer::DeviceBuffer;
use super::pipeline::GraphicsPipeline;
use super::targets::DeviceImage;
use super::DeviceContext;

/// Source/destination access and stage masks for a supported layout
/// transition. `None` means the pair is not supported.
pub fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Option<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Some((
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Some((
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ))
        }
        _ => None,
    }
}

/// Transition `image` between layouts on the transient pool.
///
/// An unsupported (old, new) pair is a fatal error rather than a silent
/// wrong-mask barrier.
pub fn transition_image_layout(
    device: &DeviceContext,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old_layout, new_layout)
        .with_context(|| {
            format!(
                "Unsupported image layout transition {:?} -> {:?}",
                old_layout, new_layout
            )
        })?;

    let cmd = device.begin_single_time_commands()?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    device.end_single_time_commands(cmd)
}

fn copy_buffer_to_image(
    device: &DeviceContext,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> Result<()> {
    let cmd = device.begin_single_time_commands()?;

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build();

    unsafe {
        device.device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    device.end_single_time_commands(cmd)
}

fn create_sampler(device: &DeviceContext, anisotropy_enabled: bool) -> Result<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy_enabled)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe {
        device
            .device
            .create_sampler(&create_info, None)
            .context("Failed to create sampler")
    }
}

/// Shader-sampled RGBA8 image.
pub struct Texture {
    image: DeviceImage,
    sampler: vk::Sampler,
    device: Arc<DeviceContext>,
}

impl Texture {
    /// Upload tightly packed RGBA8 `pixels` of `width x height`.
    pub fn new(
        device: Arc<DeviceContext>,
        pixels: &[u8],
        width: u32,
        height: u32,
        anisotropy_enabled: bool,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            anyhow::bail!(
                "Pixel data is {} bytes; {}x{} RGBA needs {}",
                pixels.len(),
                width,
                height,
                expected
            );
        }

        let staging = DeviceBuffer::new(
            device.clone(),
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let mapped = staging
            .mapped_ptr()
            .context("Staging allocation is not host mapped")?;
        unsafe {
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), mapped, pixels.len());
        }

        let image = DeviceImage::new(
            device.clone(),
            vk::Extent2D { width, height },
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageAspectFlags::COLOR,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::SampleCountFlags::TYPE_1,
        )?;

        transition_image_layout(
            &device,
            image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_buffer_to_image(&device, staging.buffer, image.image, width, height)?;
        transition_image_layout(
            &device,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let sampler = create_sampler(&device, anisotropy_enabled)?;

        Ok(Self {
            image,
            sampler,
            device,
        })
    }

    /// Write this texture's combined image sampler into `binding`.
    pub fn bind_to_pipeline(&self, binding: u32, pipeline: &mut GraphicsPipeline) -> Result<()> {
        pipeline.bind_texture(binding, self.image.view, self.sampler)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
        }
        // image view and memory release with the DeviceImage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_some());
        assert!(transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        )
        .is_some());
    }

    #[test]
    fn unknown_transition_is_rejected() {
        assert!(transition_masks(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PRESENT_SRC_KHR
        )
        .is_none());
    }
}
