// Renderer - frame synchronization ring and drawing facade
//
// Owns the surface, swapchain, render targets and N frame slots, and drives
// the begin/end-frame protocol. One CPU thread submits frames; GPU work for
// slot i never starts before slot i's previous submission retired (fence
// wait). Different slots may overlap on the GPU.
//
// FRAME PROTOCOL:
// 1. begin_frame: extent check -> fence wait -> acquire -> record
// 2. drawing code binds pipelines/buffers and issues draws
// 3. end_frame: submit -> present -> advance ring index
//
// A frame abandoned by recreation is returned with `skipped` set; end_frame
// still advances the ring so slot rotation stays in lock-step.

use anyhow::{Context, Result};
use ash::vk;
use glam::Vec4;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::buffer::{IndexBuffer, PerFrameBuffer, VertexBuffer};
use crate::backend::pipeline::{GraphicsPipeline, PushConstantRange};
use crate::backend::swapchain::{self, AcquireResult, PresentResult, Swapchain};
use crate::backend::sync::FrameSync;
use crate::backend::targets::{self, RenderTargets};
use crate::backend::DeviceContext;
use crate::config::RendererSettings;

/// Upper bound on one in-flight fence wait. Exceeding it means the GPU is
/// hung, which surfaces as a fatal, diagnosable error instead of an
/// indefinite stall.
pub const FENCE_WAIT_TIMEOUT_NS: u64 = 5_000_000_000;

/// Ring index following `current`.
pub fn next_frame_index(current: usize, frame_count: usize) -> usize {
    (current + 1) % frame_count
}

/// One slot of the frame ring.
///
/// The command buffer is reset and reused every cycle; the sync objects live
/// until ring teardown.
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    skipped: bool,
}

/// What `begin_frame` handed out: the ring slot used this frame, and whether
/// the frame was abandoned to a swapchain recreation.
///
/// Drawing code must not record draws on a skipped frame; `end_frame` must
/// still be called.
#[derive(Debug, Clone, Copy)]
pub struct FrameHandle {
    pub index: usize,
    pub skipped: bool,
}

pub struct Renderer {
    frames: Vec<FrameSlot>,
    current_frame: usize,
    image_index: u32,
    /// Set on a suboptimal acquire; recreation is deferred until after
    /// present so the acquired image still completes.
    pending_recreate: bool,

    command_pool: vk::CommandPool,
    targets: Option<RenderTargets>,
    swapchain: Option<Swapchain>,
    render_pass: vk::RenderPass,
    samples: vk::SampleCountFlags,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,

    window: Arc<Window>,
    device: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(
        device: Arc<DeviceContext>,
        window: Arc<Window>,
        settings: &RendererSettings,
    ) -> Result<Self> {
        if settings.max_frames_in_flight == 0 {
            anyhow::bail!("max_frames_in_flight must be at least 1");
        }

        let surface_loader =
            ash::extensions::khr::Surface::new(device.entry(), &device.instance);
        let surface = swapchain::create_surface(&device, &window)?;

        let size = window.inner_size();
        let swapchain_obj = Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            size.width,
            size.height,
        )?;

        let samples = device.sample_count(settings.msaa_enabled);
        let render_pass = targets::create_render_pass(&device, swapchain_obj.format, samples)?;
        let render_targets =
            RenderTargets::new(device.clone(), &swapchain_obj, render_pass, samples)?;

        // One pool for the ring; buffers are reset individually each cycle
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create graphics command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(settings.max_frames_in_flight as u32);
        let command_buffers = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate frame command buffers")?
        };

        let frames: Result<Vec<FrameSlot>> = command_buffers
            .into_iter()
            .map(|command_buffer| {
                Ok(FrameSlot {
                    sync: FrameSync::new(&device.device)?,
                    command_buffer,
                    skipped: false,
                })
            })
            .collect();

        log::info!(
            "Renderer ready: {} frames in flight, {:?} samples",
            settings.max_frames_in_flight,
            samples
        );

        Ok(Self {
            frames: frames?,
            current_frame: 0,
            image_index: 0,
            pending_recreate: false,
            command_pool,
            targets: Some(render_targets),
            swapchain: Some(swapchain_obj),
            render_pass,
            samples,
            surface,
            surface_loader,
            window,
            device,
        })
    }

    fn swapchain_ref(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn targets_ref(&self) -> Result<&RenderTargets> {
        self.targets.as_ref().context("Render targets not initialized")
    }

    /// Begin the current ring slot's frame.
    ///
    /// The fence wait here is the protocol's only CPU stall; it bounds how
    /// far the CPU can run ahead of the GPU to the ring size.
    pub fn begin_frame(&mut self, clear_color: Vec4) -> Result<FrameHandle> {
        let index = self.current_frame;
        self.frames[index].skipped = false;

        // A zero-sized window cannot present; skip without recreating
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.frames[index].skipped = true;
            return Ok(FrameHandle {
                index,
                skipped: true,
            });
        }

        // Resize observed: abandon the frame before touching sync objects
        let extent = self.swapchain_ref()?.extent;
        if size.width != extent.width || size.height != extent.height {
            log::debug!(
                "Window size {}x{} differs from swapchain {}x{}; recreating",
                size.width,
                size.height,
                extent.width,
                extent.height
            );
            self.frames[index].skipped = true;
            self.recreate()?;
            return Ok(FrameHandle {
                index,
                skipped: true,
            });
        }

        let fence = self.frames[index].sync.in_flight_fence;
        match unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, FENCE_WAIT_TIMEOUT_NS)
        } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => anyhow::bail!(
                "Frame slot {} fence not signaled within {} ms; GPU appears hung",
                index,
                FENCE_WAIT_TIMEOUT_NS / 1_000_000
            ),
            Err(e) => return Err(e).context("Failed to wait for in-flight fence"),
        }

        let acquire = self
            .swapchain_ref()?
            .acquire_next_image(u64::MAX, self.frames[index].sync.image_available)?;

        let (image_index, suboptimal) = match acquire {
            AcquireResult::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireResult::OutOfDate => {
                log::debug!("Swapchain out of date on acquire; recreating");
                self.frames[index].skipped = true;
                self.recreate()?;
                return Ok(FrameHandle {
                    index,
                    skipped: true,
                });
            }
        };

        if suboptimal {
            // The acquired image is still presentable; recreate after present
            log::debug!("Swapchain suboptimal on acquire; recreating after present");
            self.pending_recreate = true;
        }
        self.image_index = image_index;

        let cmd = self.frames[index].command_buffer;
        let extent = self.swapchain_ref()?.extent;
        let framebuffer = self.targets_ref()?.framebuffer(image_index);

        unsafe {
            self.device.device.reset_fences(&[fence])?;
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            self.device.device.begin_command_buffer(cmd, &begin_info)?;

            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color.to_array(),
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            self.device.device.cmd_begin_render_pass(
                cmd,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );

            // Negative-height viewport flips clip space to Y-up
            let viewport = vk::Viewport {
                x: 0.0,
                y: extent.height as f32,
                width: extent.width as f32,
                height: -(extent.height as f32),
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        Ok(FrameHandle {
            index,
            skipped: false,
        })
    }

    /// Submit and present the current frame, then advance the ring.
    ///
    /// Advances even when the frame was skipped, keeping slot rotation in
    /// lock-step with the intended pacing.
    pub fn end_frame(&mut self) -> Result<()> {
        let index = self.current_frame;

        if self.frames[index].skipped {
            self.current_frame = next_frame_index(index, self.frames.len());
            return Ok(());
        }

        let cmd = self.frames[index].command_buffer;
        let sync = &self.frames[index].sync;

        unsafe {
            self.device.device.cmd_end_render_pass(cmd);
            self.device.device.end_command_buffer(cmd)?;

            let wait_semaphores = [sync.image_available];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [sync.render_finished];
            let command_buffers = [cmd];

            let submit_info = vk::SubmitInfo::builder()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    sync.in_flight_fence,
                )
                .context("Failed to submit frame to graphics queue")?;
        }

        let render_finished = self.frames[index].sync.render_finished;
        let present = self.swapchain_ref()?.present(
            self.device.graphics_queue,
            self.image_index,
            &[render_finished],
        )?;

        let needs_recreate = self.pending_recreate
            || matches!(present, PresentResult::Suboptimal | PresentResult::OutOfDate);
        if needs_recreate {
            log::debug!("Recreating swapchain after present ({:?})", present);
            self.pending_recreate = false;
            self.recreate()?;
        }

        self.current_frame = next_frame_index(index, self.frames.len());
        Ok(())
    }

    /// Tear down and rebuild everything sized to the swapchain.
    ///
    /// Blocks on a device-idle barrier; frame slots and the render pass are
    /// never recreated. A minimized window defers recreation to the next
    /// non-zero-sized frame.
    pub fn recreate(&mut self) -> Result<()> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            log::debug!("Window minimized; deferring swapchain recreation");
            return Ok(());
        }

        log::info!("Recreating swapchain: {}x{}", size.width, size.height);

        self.device.wait_idle()?;

        // Reverse dependency order: framebuffers and attachments first, then
        // image views and the swapchain itself
        self.targets = None;
        self.swapchain = None;

        let swapchain_obj = Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            size.width,
            size.height,
        )?;
        let render_targets = RenderTargets::new(
            self.device.clone(),
            &swapchain_obj,
            self.render_pass,
            self.samples,
        )?;

        self.swapchain = Some(swapchain_obj);
        self.targets = Some(render_targets);

        Ok(())
    }

    /// Bind a pipeline and, when it carries descriptors, its shared set with
    /// the current frame's dynamic offsets.
    ///
    /// Valid only between a non-skipped `begin_frame` and `end_frame`.
    pub fn bind_pipeline(&self, pipeline: &GraphicsPipeline) {
        let cmd = self.frames[self.current_frame].command_buffer;

        unsafe {
            self.device.device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );

            if let Some(set) = pipeline.descriptor_set() {
                self.device.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &[set],
                    pipeline.dynamic_offsets_for_frame(self.current_frame),
                );
            }
        }
    }

    /// Push `data` into `range` of the bound pipeline's push-constant block.
    pub fn set_push_constant(
        &self,
        pipeline: &GraphicsPipeline,
        range: &PushConstantRange,
        data: &[u8],
    ) {
        let cmd = self.frames[self.current_frame].command_buffer;

        unsafe {
            self.device
                .device
                .cmd_push_constants(cmd, pipeline.layout, range.stages, range.offset, data);
        }
    }

    /// Draw `vertex_count` unindexed vertices.
    pub fn draw(&self, vertex_buffer: &VertexBuffer, vertex_count: u32, instance_count: u32) {
        let cmd = self.frames[self.current_frame].command_buffer;

        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            self.device
                .device
                .cmd_draw(cmd, vertex_count, instance_count, 0, 0);
        }
    }

    /// Draw the index buffer's full range.
    pub fn draw_indexed(
        &self,
        vertex_buffer: &VertexBuffer,
        index_buffer: &IndexBuffer,
        instance_count: u32,
    ) {
        let cmd = self.frames[self.current_frame].command_buffer;

        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            self.device.device.cmd_bind_index_buffer(
                cmd,
                index_buffer.handle(),
                0,
                vk::IndexType::UINT32,
            );
            self.device
                .device
                .cmd_draw_indexed(cmd, index_buffer.count(), instance_count, 0, 0, 0);
        }
    }

    /// Write `data` into `buffer`'s window for the current frame slot.
    ///
    /// Safe against in-flight GPU reads because this slot's fence was waited
    /// on in `begin_frame`.
    pub fn update_per_frame_buffer(&self, buffer: &PerFrameBuffer, data: &[u8]) -> Result<()> {
        buffer.write(self.current_frame, data)
    }

    pub fn frame_index(&self) -> usize {
        self.current_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn extent(&self) -> Result<vk::Extent2D> {
        Ok(self.swapchain_ref()?.extent)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");

        let _ = self.device.wait_idle();

        unsafe {
            for frame in &self.frames {
                frame.sync.destroy(&self.device.device);
            }

            // Pool teardown frees the ring's command buffers with it
            self.device.device.destroy_command_pool(self.command_pool, None);

            self.targets = None;
            self.swapchain = None;

            self.device.device.destroy_render_pass(self.render_pass, None);

            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cycles_through_every_slot() {
        for frame_count in 1..=4 {
            let mut index = 0;
            let mut visited = Vec::new();
            for _ in 0..(frame_count * 3) {
                visited.push(index);
                index = next_frame_index(index, frame_count);
            }
            // Three full laps, each visiting 0..frame_count in order
            let expected: Vec<usize> = (0..frame_count).cycle().take(frame_count * 3).collect();
            assert_eq!(visited, expected);
            assert_eq!(index, 0);
        }
    }

    #[test]
    fn ring_advance_is_unconditional_on_skip() {
        // Skipped frames advance through the same successor function, so a
        // run of skips still rotates the ring in lock-step
        let mut index = 0;
        for skipped in [false, true, true, false, true] {
            let _ = skipped;
            index = next_frame_index(index, 3);
        }
        assert_eq!(index, 5 % 3);
    }

    #[test]
    fn single_slot_ring_stays_on_zero() {
        assert_eq!(next_frame_index(0, 1), 0);
    }
}
