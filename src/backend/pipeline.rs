// Graphics pipeline and descriptor infrastructure
//
// The layout model is declarative: callers describe vertex bindings, shader
// uniforms and push constants; the builder derives strides, descriptor
// layouts and the dynamic-offset table from declaration order. Declared
// order therefore IS the memory layout contract with the data producer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::shader::ShaderStage;
use super::DeviceContext;

// ---------------------------------------------------------------------------
// Vertex layout
// ---------------------------------------------------------------------------

/// Scalar/vector type of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexAttributeKind {
    Float,
    Vec2,
    Vec3,
    Vec4,
}

impl VertexAttributeKind {
    pub fn size(self) -> u32 {
        match self {
            VertexAttributeKind::Float => 4,
            VertexAttributeKind::Vec2 => 8,
            VertexAttributeKind::Vec3 => 12,
            VertexAttributeKind::Vec4 => 16,
        }
    }

    pub fn format(self) -> vk::Format {
        match self {
            VertexAttributeKind::Float => vk::Format::R32_SFLOAT,
            VertexAttributeKind::Vec2 => vk::Format::R32G32_SFLOAT,
            VertexAttributeKind::Vec3 => vk::Format::R32G32B32_SFLOAT,
            VertexAttributeKind::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// One attribute inside a vertex binding.
#[derive(Debug, Clone, Copy)]
pub struct VertexAttribute {
    pub location: u32,
    pub kind: VertexAttributeKind,
}

/// Whether a binding advances per vertex or per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

impl VertexInputRate {
    fn to_vk(self) -> vk::VertexInputRate {
        match self {
            VertexInputRate::Vertex => vk::VertexInputRate::VERTEX,
            VertexInputRate::Instance => vk::VertexInputRate::INSTANCE,
        }
    }
}

/// One vertex buffer binding: input rate plus attributes in memory order.
#[derive(Debug, Clone)]
pub struct VertexBinding {
    pub input_rate: VertexInputRate,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexBinding {
    /// Binding stride: attribute sizes summed in declared order.
    pub fn stride(&self) -> u32 {
        self.attributes.iter().map(|a| a.kind.size()).sum()
    }
}

/// Expand the declarative vertex layout into Vulkan binding/attribute
/// descriptions. Attribute offsets accumulate in declared order.
pub fn vertex_input_descriptions(
    layout: &[VertexBinding],
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut bindings = Vec::with_capacity(layout.len());
    let mut attributes = Vec::new();

    for (index, binding) in layout.iter().enumerate() {
        let mut offset = 0;
        for attribute in &binding.attributes {
            attributes.push(
                vk::VertexInputAttributeDescription::builder()
                    .binding(index as u32)
                    .location(attribute.location)
                    .format(attribute.kind.format())
                    .offset(offset)
                    .build(),
            );
            offset += attribute.kind.size();
        }

        bindings.push(
            vk::VertexInputBindingDescription::builder()
                .binding(index as u32)
                .stride(offset)
                .input_rate(binding.input_rate.to_vk())
                .build(),
        );
    }

    (bindings, attributes)
}

// ---------------------------------------------------------------------------
// Uniform layout
// ---------------------------------------------------------------------------

/// Resource class of a shader binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderBindingKind {
    UniformBuffer,
    StorageBuffer,
    Texture,
}

impl ShaderBindingKind {
    /// Buffer bindings use the dynamic descriptor types; their per-frame
    /// offset arrives at bind time from the dynamic-offset table.
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ShaderBindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            ShaderBindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            ShaderBindingKind::Texture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            ShaderBindingKind::UniformBuffer | ShaderBindingKind::StorageBuffer
        )
    }
}

/// One entry of the uniform layout.
#[derive(Debug, Clone, Copy)]
pub struct ShaderBinding {
    pub binding: u32,
    pub kind: ShaderBindingKind,
    pub stages: vk::ShaderStageFlags,
}

/// Number of buffer-typed bindings; sizes the dynamic-offset table.
pub fn buffer_binding_count(layout: &[ShaderBinding]) -> usize {
    layout.iter().filter(|b| b.kind.is_buffer()).count()
}

/// Push constant range forwarded to the pipeline layout.
#[derive(Debug, Clone, Copy)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

// ---------------------------------------------------------------------------
// Dynamic-offset table
// ---------------------------------------------------------------------------

/// Frame-major table of dynamic offsets, `frames x buffer_bindings` entries.
///
/// Each buffer bound to the pipeline claims the next slot; at draw time the
/// current frame's contiguous slice is handed to the descriptor bind. Binds
/// must happen in the order the uniform layout declared the buffers, since a
/// slot is identified only by claim order.
pub struct DynamicOffsetTable {
    offsets: Vec<u32>,
    binding_count: usize,
    frames: usize,
    next_slot: usize,
}

impl DynamicOffsetTable {
    pub fn new(frames: usize, binding_count: usize) -> Self {
        Self {
            offsets: vec![0; frames * binding_count],
            binding_count,
            frames,
            next_slot: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Claim the next slot and record `frame * stride` for every frame.
    pub fn claim_slot(&mut self, stride: u64) -> Result<usize> {
        if self.next_slot >= self.binding_count {
            anyhow::bail!(
                "All {} buffer binding slots already claimed",
                self.binding_count
            );
        }

        let slot = self.next_slot;
        self.next_slot += 1;

        for frame in 0..self.frames {
            self.offsets[frame * self.binding_count + slot] = (frame as u64 * stride) as u32;
        }

        Ok(slot)
    }

    /// The offsets to pass for `frame`, one per claimed buffer binding.
    pub fn offsets_for_frame(&self, frame: usize) -> &[u32] {
        let start = frame * self.binding_count;
        &self.offsets[start..start + self.binding_count]
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Descriptor infrastructure, present only when the uniform layout is
/// non-empty. One descriptor set is shared across frames; per-frame buffer
/// regions are selected through the dynamic-offset table.
struct PipelineDescriptors {
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    offsets: DynamicOffsetTable,
}

/// Compiled graphics pipeline with its layout and optional descriptors.
///
/// Owned as a value; teardown happens in `Drop`, in reverse creation order.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    descriptors: Option<PipelineDescriptors>,
    device: Arc<DeviceContext>,
}

impl GraphicsPipeline {
    /// Compile a graphics pipeline against `render_pass`.
    ///
    /// Failure here is fatal: the process cannot draw anything meaningful
    /// without its pipeline, and descriptor-pool exhaustion at creation
    /// means the layout itself is wrong.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<DeviceContext>,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
        frames_in_flight: usize,
        stages: &[ShaderStage],
        vertex_layout: &[VertexBinding],
        uniform_layout: &[ShaderBinding],
        push_constants: &[PushConstantRange],
    ) -> Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("Pipeline requires at least one shader stage");
        }
        for stage in stages {
            if stage.module == vk::ShaderModule::null() {
                anyhow::bail!("Uninitialized {:?} shader stage", stage.kind);
            }
        }

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.kind.flags())
                    .module(stage.module)
                    .name(&stage.entry)
                    .build()
            })
            .collect();

        let (bindings, attributes) = vertex_input_descriptions(vertex_layout);
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only counts are fixed here
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();

        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let set_layout = if uniform_layout.is_empty() {
            None
        } else {
            Some(create_descriptor_set_layout(&device, uniform_layout)?)
        };

        let push_constant_ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|range| {
                vk::PushConstantRange::builder()
                    .stage_flags(range.stages)
                    .offset(range.offset)
                    .size(range.size)
                    .build()
            })
            .collect();

        let set_layouts: Vec<vk::DescriptorSetLayout> = set_layout.iter().copied().collect();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let pipeline_layout = unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .dynamic_state(&dynamic_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create graphics pipeline")?
        };

        let descriptors = match set_layout {
            Some(set_layout) => {
                let pool = create_descriptor_pool(&device, uniform_layout)?;
                let set = allocate_descriptor_set(&device, set_layout, pool)?;
                let offsets = DynamicOffsetTable::new(
                    frames_in_flight,
                    buffer_binding_count(uniform_layout),
                );
                Some(PipelineDescriptors {
                    set_layout,
                    pool,
                    set,
                    offsets,
                })
            }
            None => None,
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout: pipeline_layout,
            descriptors,
            device,
        })
    }

    /// Shared descriptor set, if the uniform layout declared any bindings.
    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.descriptors.as_ref().map(|d| d.set)
    }

    /// Dynamic offsets for `frame`, empty when no buffers are bound.
    pub fn dynamic_offsets_for_frame(&self, frame: usize) -> &[u32] {
        match &self.descriptors {
            Some(d) => d.offsets.offsets_for_frame(frame),
            None => &[],
        }
    }

    /// Point `binding` at `buffer` with a per-frame window of `stride` bytes
    /// and claim the next dynamic-offset slot.
    ///
    /// Buffers MUST be bound in the order the uniform layout declared them:
    /// slots are consumed sequentially and a misordered bind silently swaps
    /// per-frame offsets between buffers.
    pub fn bind_buffer(
        &mut self,
        binding: u32,
        kind: ShaderBindingKind,
        buffer: vk::Buffer,
        stride: u64,
    ) -> Result<()> {
        let descriptors = self
            .descriptors
            .as_mut()
            .context("Pipeline declares no uniform bindings")?;

        descriptors.offsets.claim_slot(stride)?;

        let buffer_info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(0)
            .range(stride)
            .build();

        let buffer_infos = [buffer_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(descriptors.set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(kind.descriptor_type())
            .buffer_info(&buffer_infos)
            .build();

        unsafe {
            self.device.device.update_descriptor_sets(&[write], &[]);
        }

        Ok(())
    }

    /// Point `binding` at a combined image sampler. Does not consume a
    /// dynamic-offset slot.
    pub fn bind_texture(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<()> {
        let descriptors = self
            .descriptors
            .as_ref()
            .context("Pipeline declares no uniform bindings")?;

        let image_info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(view)
            .sampler(sampler)
            .build();

        let image_infos = [image_info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(descriptors.set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();

        unsafe {
            self.device.device.update_descriptor_sets(&[write], &[]);
        }

        Ok(())
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            if let Some(descriptors) = self.descriptors.take() {
                self.device
                    .device
                    .destroy_descriptor_pool(descriptors.pool, None);
                self.device
                    .device
                    .destroy_descriptor_set_layout(descriptors.set_layout, None);
            }
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_descriptor_set_layout(
    device: &DeviceContext,
    uniform_layout: &[ShaderBinding],
) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = uniform_layout
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding.binding)
                .descriptor_type(binding.kind.descriptor_type())
                .descriptor_count(1)
                .stage_flags(binding.stages)
                .build()
        })
        .collect();

    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    unsafe {
        device
            .device
            .create_descriptor_set_layout(&create_info, None)
            .context("Failed to create descriptor set layout")
    }
}

fn create_descriptor_pool(
    device: &DeviceContext,
    uniform_layout: &[ShaderBinding],
) -> Result<vk::DescriptorPool> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = uniform_layout
        .iter()
        .map(|binding| {
            vk::DescriptorPoolSize::builder()
                .ty(binding.kind.descriptor_type())
                .descriptor_count(1)
                .build()
        })
        .collect();

    let create_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(1);

    unsafe {
        device
            .device
            .create_descriptor_pool(&create_info, None)
            .context("Failed to create descriptor pool")
    }
}

fn allocate_descriptor_set(
    device: &DeviceContext,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
) -> Result<vk::DescriptorSet> {
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    let sets = unsafe {
        device
            .device
            .allocate_descriptor_sets(&alloc_info)
            .context("Failed to allocate descriptor set")?
    };

    Ok(sets[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec3(location: u32) -> VertexAttribute {
        VertexAttribute {
            location,
            kind: VertexAttributeKind::Vec3,
        }
    }

    #[test]
    fn binding_stride_sums_declared_attributes() {
        let binding = VertexBinding {
            input_rate: VertexInputRate::Vertex,
            attributes: vec![
                vec3(0),
                vec3(1),
                VertexAttribute {
                    location: 2,
                    kind: VertexAttributeKind::Vec2,
                },
            ],
        };
        assert_eq!(binding.stride(), 12 + 12 + 8);
    }

    #[test]
    fn attribute_offsets_accumulate_in_declared_order() {
        let layout = [VertexBinding {
            input_rate: VertexInputRate::Vertex,
            attributes: vec![
                vec3(0),
                vec3(1),
                VertexAttribute {
                    location: 2,
                    kind: VertexAttributeKind::Vec2,
                },
            ],
        }];

        let (bindings, attributes) = vertex_input_descriptions(&layout);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 32);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn instance_rate_binding_maps_through() {
        let layout = [
            VertexBinding {
                input_rate: VertexInputRate::Vertex,
                attributes: vec![vec3(0)],
            },
            VertexBinding {
                input_rate: VertexInputRate::Instance,
                attributes: vec![VertexAttribute {
                    location: 1,
                    kind: VertexAttributeKind::Vec4,
                }],
            },
        ];

        let (bindings, attributes) = vertex_input_descriptions(&layout);

        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(attributes[1].binding, 1);
    }

    #[test]
    fn buffer_binding_count_ignores_textures() {
        let layout = [
            ShaderBinding {
                binding: 0,
                kind: ShaderBindingKind::UniformBuffer,
                stages: vk::ShaderStageFlags::VERTEX,
            },
            ShaderBinding {
                binding: 1,
                kind: ShaderBindingKind::Texture,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
            ShaderBinding {
                binding: 2,
                kind: ShaderBindingKind::StorageBuffer,
                stages: vk::ShaderStageFlags::VERTEX,
            },
        ];
        assert_eq!(buffer_binding_count(&layout), 2);
    }

    #[test]
    fn offset_table_sized_frames_times_buffer_bindings() {
        // 2 buffer bindings, 3 frames in flight
        let table = DynamicOffsetTable::new(3, 2);
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn offset_table_claims_slots_in_bind_order() {
        let mut table = DynamicOffsetTable::new(3, 2);

        // Buffer A (stride 256) bound first, buffer B (stride 512) second
        assert_eq!(table.claim_slot(256).unwrap(), 0);
        assert_eq!(table.claim_slot(512).unwrap(), 1);

        assert_eq!(table.offsets_for_frame(0), &[0, 0]);
        assert_eq!(table.offsets_for_frame(1), &[256, 512]);
        assert_eq!(table.offsets_for_frame(2), &[512, 1024]);
    }

    #[test]
    fn offset_table_rejects_extra_claims() {
        let mut table = DynamicOffsetTable::new(2, 1);
        table.claim_slot(64).unwrap();
        assert!(table.claim_slot(64).is_err());
    }

    #[test]
    fn empty_offset_table_has_no_offsets() {
        let table = DynamicOffsetTable::new(2, 0);
        assert!(table.is_empty());
        assert_eq!(table.offsets_for_frame(1), &[] as &[u32]);
    }
}
