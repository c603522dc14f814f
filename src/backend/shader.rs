// Shader module loading
//
// Shaders arrive as compiled SPIR-V from the asset collaborator; this module
// wraps them into stage descriptions the pipeline builder consumes opaquely.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;

use super::DeviceContext;

/// Pipeline stage a shader module is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStageKind {
    Vertex,
    Fragment,
}

impl ShaderStageKind {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStageKind::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// One compiled shader stage: module handle, stage tag, entry point.
pub struct ShaderStage {
    pub module: vk::ShaderModule,
    pub kind: ShaderStageKind,
    pub entry: CString,
}

impl ShaderStage {
    /// Create a shader module from SPIR-V bytes.
    pub fn new(
        device: &DeviceContext,
        code: &[u8],
        kind: ShaderStageKind,
        entry_point: &str,
    ) -> Result<Self> {
        let module = create_shader_module(device, code)?;
        let entry = CString::new(entry_point).context("Shader entry point contains NUL")?;

        Ok(Self {
            module,
            kind,
            entry,
        })
    }

    pub fn destroy(&self, device: &DeviceContext) {
        unsafe {
            device.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Load SPIR-V from bytes and create a shader module.
pub fn create_shader_module(device: &DeviceContext, code: &[u8]) -> Result<vk::ShaderModule> {
    // SPIR-V is a stream of 4-byte words
    if code.is_empty() || code.len() % 4 != 0 {
        anyhow::bail!(
            "Shader binary length {} is not a multiple of 4; not valid SPIR-V",
            code.len()
        );
    }

    // Safety: length checked above; the shader compiler produces aligned data
    let code_aligned =
        unsafe { std::slice::from_raw_parts(code.as_ptr() as *const u32, code.len() / 4) };

    let create_info = vk::ShaderModuleCreateInfo::builder().code(code_aligned);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_kinds_map_to_vulkan_flags() {
        assert_eq!(ShaderStageKind::Vertex.flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(
            ShaderStageKind::Fragment.flags(),
            vk::ShaderStageFlags::FRAGMENT
        );
    }
}
