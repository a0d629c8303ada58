use std::borrow::Cow;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a non-zero multiple of 4")]
    InvalidLength(usize),

    #[error("Not a SPIR-V module (magic word {0:#010x})")]
    InvalidMagic(u32),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// The single pipeline stage an entry point is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Reinterpret SPIR-V bytes as words, borrowing when already aligned.
///
/// SPIR-V is little-endian; the copy path decodes explicitly so it is
/// correct on any host.
fn spirv_words(bytes: &[u8]) -> Result<Cow<'_, [u32]>, CreateShaderModuleError> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(CreateShaderModuleError::InvalidLength(bytes.len()));
    }

    // SAFETY: u32 has no invalid bit patterns and the length is a multiple
    // of 4.
    let (prefix, aligned, _suffix) = unsafe { bytes.align_to::<u32>() };
    let words: Cow<'_, [u32]> = if prefix.is_empty() && cfg!(target_endian = "little")
    {
        Cow::Borrowed(aligned)
    } else {
        Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    };

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(CreateShaderModuleError::InvalidMagic(other)),
        None => Err(CreateShaderModuleError::InvalidLength(0)),
    }
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytes.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let code = spirv_words(spirv_bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info holds a SPIR-V word stream with a valid header.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        // SAFETY: handle is a valid shader module created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name shader module {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Pair this module with an entry point name and stage.
    ///
    /// Fails only if `name` contains an interior NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines keep no
        // reference to the module after creation.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A [`ShaderModule`] entry point for one stage; borrows the module so it
/// outlives any stage create info built from it.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    pub fn as_pipeline_stage_create_info(
        &self,
    ) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn spirv_words_decodes_header() {
        let bytes = module_bytes();
        let words = spirv_words(&bytes).expect("valid header");
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn spirv_words_handles_unaligned_input() {
        let mut padded = vec![0u8];
        padded.extend(module_bytes());
        let words = spirv_words(&padded[1..]).expect("valid header");
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn spirv_words_rejects_bad_input() {
        assert!(matches!(
            spirv_words(&[]),
            Err(CreateShaderModuleError::InvalidLength(0))
        ));
        assert!(matches!(
            spirv_words(&[1, 2, 3]),
            Err(CreateShaderModuleError::InvalidLength(3))
        ));
        assert!(matches!(
            spirv_words(&[0xef, 0xbe, 0xad, 0xde]),
            Err(CreateShaderModuleError::InvalidMagic(0xdead_beef))
        ));
    }
}
