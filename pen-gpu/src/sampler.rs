//! Sampler wrapper ([`Sampler`]).

use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// Filtering and addressing state for a [`Sampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_u: vk::SamplerAddressMode::REPEAT,
            address_v: vk::SamplerAddressMode::REPEAT,
            address_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(
        device: &Arc<Device>,
        desc: &SamplerDesc,
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_u)
            .address_mode_v(desc.address_v)
            .address_mode_w(desc.address_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(false);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_sampler(&create_info) }?;

        // SAFETY: handle is a valid sampler from this device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name sampler {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: handle was created from parent and no GPU work still
        // references it.
        unsafe { self.parent.destroy_raw_sampler(self.handle) };
    }
}
