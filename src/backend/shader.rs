// Shader module loading
//
// Shaders are SPIR-V files produced by build.rs (or compiled by hand with
// glslc) and read at runtime.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

/// Read a SPIR-V binary into correctly aligned words
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open shader {:?}", path))?;

    ash::util::read_spv(&mut file).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Shader module destroyed when it goes out of scope. Only needed until the
/// pipeline using it has been created.
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a ash::Device,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a ash::Device, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}
