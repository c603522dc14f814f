// GPU buffers
//
// DeviceBuffer is the raw building block. VertexBuffer/IndexBuffer are
// device-local and filled through a staging copy on the transient pool.
// PerFrameBuffer is the aligned per-frame allocator behind dynamic-offset
// uniform/storage bindings: one allocation, one persistent mapping, one
// alignment-padded stride per frame in flight.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::pipeline::{GraphicsPipeline, ShaderBindingKind};
use super::DeviceContext;

/// Round `size` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two (Vulkan guarantees this for offset
/// alignments).
pub fn aligned_stride(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

/// Byte offset of `frame`'s window within a per-frame allocation.
pub fn frame_offset(stride: u64, frame: usize) -> u64 {
    stride * frame as u64
}

/// Buffer handle plus its backing allocation.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    allocation: Option<Allocation>,
    device: Arc<DeviceContext>,
}

impl DeviceBuffer {
    pub fn new(
        device: Arc<DeviceContext>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name: "device-buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind buffer memory")?;
        }

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device,
        })
    }

    /// Persistent host mapping, present for host-visible locations.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr() as *mut u8)
    }

    /// Copy `src`'s full contents into this buffer on the transient pool.
    pub fn copy_from(&self, src: &DeviceBuffer) -> Result<()> {
        let cmd = self.device.begin_single_time_commands()?;

        let region = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(src.size)
            .build();

        unsafe {
            self.device
                .device
                .cmd_copy_buffer(cmd, src.buffer, self.buffer, &[region]);
        }

        self.device.end_single_time_commands(cmd)
    }

    /// Create a device-local buffer and fill it through a staging copy.
    pub fn new_with_data<T: Copy>(
        device: Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as u64;

        let staging = DeviceBuffer::new(
            device.clone(),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let mapped = staging
            .mapped_ptr()
            .context("Staging allocation is not host mapped")?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, mapped, size as usize);
        }

        let buffer = DeviceBuffer::new(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        buffer.copy_from(&staging)?;

        Ok(buffer)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator().lock().free(allocation);
        }
    }
}

/// Device-local vertex data.
pub struct VertexBuffer {
    buffer: DeviceBuffer,
}

impl VertexBuffer {
    pub fn new<T: Copy>(device: Arc<DeviceContext>, vertices: &[T]) -> Result<Self> {
        let buffer =
            DeviceBuffer::new_with_data(device, vk::BufferUsageFlags::VERTEX_BUFFER, vertices)?;
        Ok(Self { buffer })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }
}

/// Device-local u32 index data.
pub struct IndexBuffer {
    buffer: DeviceBuffer,
    count: u32,
}

impl IndexBuffer {
    pub fn new(device: Arc<DeviceContext>, indices: &[u32]) -> Result<Self> {
        let buffer =
            DeviceBuffer::new_with_data(device, vk::BufferUsageFlags::INDEX_BUFFER, indices)?;
        Ok(Self {
            buffer,
            count: indices.len() as u32,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Which descriptor class a per-frame buffer feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerFrameBufferKind {
    Uniform,
    Storage,
}

impl PerFrameBufferKind {
    fn usage(self) -> vk::BufferUsageFlags {
        match self {
            PerFrameBufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            PerFrameBufferKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        }
    }

    /// Offset alignment is per binding type, reported by the device.
    fn alignment(self, device: &DeviceContext) -> u64 {
        match self {
            PerFrameBufferKind::Uniform => device.min_uniform_buffer_offset_alignment(),
            PerFrameBufferKind::Storage => device.min_storage_buffer_offset_alignment(),
        }
    }

    fn binding_kind(self) -> ShaderBindingKind {
        match self {
            PerFrameBufferKind::Uniform => ShaderBindingKind::UniformBuffer,
            PerFrameBufferKind::Storage => ShaderBindingKind::StorageBuffer,
        }
    }
}

/// One contiguous allocation of `stride x frames` bytes, mapped for its whole
/// lifetime and sliced by frame index.
///
/// This type does NOT guard against overwriting a frame window the GPU is
/// still reading; that ordering comes from the frame ring's fence wait.
pub struct PerFrameBuffer {
    buffer: DeviceBuffer,
    mapped: *mut u8,
    kind: PerFrameBufferKind,
    logical_size: u64,
    stride: u64,
    frames: usize,
}

impl PerFrameBuffer {
    pub fn new(
        device: Arc<DeviceContext>,
        kind: PerFrameBufferKind,
        logical_size: u64,
        frames: usize,
    ) -> Result<Self> {
        if logical_size == 0 {
            anyhow::bail!("Per-frame buffer needs a non-zero size");
        }
        if frames == 0 {
            anyhow::bail!("Per-frame buffer needs at least one frame");
        }

        let stride = aligned_stride(logical_size, kind.alignment(&device));

        let buffer = DeviceBuffer::new(
            device,
            stride * frames as u64,
            kind.usage(),
            MemoryLocation::CpuToGpu,
        )?;

        let mapped = buffer
            .mapped_ptr()
            .context("Per-frame allocation is not host mapped")?;

        Ok(Self {
            buffer,
            mapped,
            kind,
            logical_size,
            stride,
            frames,
        })
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// Alignment-padded per-frame stride; `stride >= logical_size` and
    /// `stride % alignment == 0`.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Copy `data` into frame `frame_index`'s window.
    ///
    /// Writes land in `[frame_index * stride, frame_index * stride +
    /// logical_size)` only. The caller (normally the frame ring) must have
    /// observed that the GPU retired its last read of this window.
    pub fn write(&self, frame_index: usize, data: &[u8]) -> Result<()> {
        if frame_index >= self.frames {
            anyhow::bail!(
                "Frame index {} out of range (frames in flight: {})",
                frame_index,
                self.frames
            );
        }
        if data.len() as u64 != self.logical_size {
            anyhow::bail!(
                "Data length {} does not match per-frame size {}",
                data.len(),
                self.logical_size
            );
        }

        unsafe {
            let dst = self.mapped.add(frame_offset(self.stride, frame_index) as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        Ok(())
    }

    /// Register this buffer on `binding`, claiming the next dynamic-offset
    /// slot. The descriptor covers one `stride`-sized window; per-frame
    /// offsets come from the table at draw time.
    ///
    /// Bind buffers in the exact order the pipeline's uniform layout
    /// declared them.
    pub fn bind_to_pipeline(&self, binding: u32, pipeline: &mut GraphicsPipeline) -> Result<()> {
        pipeline.bind_buffer(
            binding,
            self.kind.binding_kind(),
            self.buffer.buffer,
            self.stride,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_padded_up_to_alignment() {
        assert_eq!(aligned_stride(100, 64), 128);
        assert_eq!(aligned_stride(1, 256), 256);
        assert_eq!(aligned_stride(257, 256), 512);
    }

    #[test]
    fn stride_identity_when_already_aligned() {
        assert_eq!(aligned_stride(256, 256), 256);
        assert_eq!(aligned_stride(512, 64), 512);
    }

    #[test]
    fn stride_properties_hold_across_sizes() {
        for alignment in [1u64, 16, 64, 256, 4096] {
            for size in [1u64, 7, 63, 64, 65, 100, 255, 256, 1000, 65536] {
                let stride = aligned_stride(size, alignment);
                assert!(stride >= size, "stride {} < size {}", stride, size);
                assert_eq!(stride % alignment, 0);
                // Minimal padding: never a full extra alignment block
                assert!(stride - size < alignment);
            }
        }
    }

    #[test]
    fn frame_windows_do_not_overlap() {
        let stride = aligned_stride(100, 64);
        let a = frame_offset(stride, 0);
        let b = frame_offset(stride, 1);
        let c = frame_offset(stride, 2);
        assert!(a + 100 <= b);
        assert!(b + 100 <= c);
        assert_eq!(c, 2 * stride);
    }
}
