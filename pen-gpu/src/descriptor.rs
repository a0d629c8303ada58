//! Descriptor set layout, pool, and set wrappers.
//!
//! [`DescriptorSetLayout`] describes the binding slots within a set.
//! [`DescriptorPool`] hands out [`DescriptorSet`]s and is reset wholesale
//! once the GPU is done with them. [`DescriptorWrites`] batches updates to
//! any number of sets into one `vkUpdateDescriptorSets` call.

use std::sync::Arc;

use ash::vk;

use crate::buffer::BufferHandle;
use crate::device::Device;

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

/// A single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length of the binding.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<DescriptorBindingDesc> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

/// Pool sizes that fit `sets` allocations of a layout with `bindings`.
pub fn pool_sizes_for(
    bindings: &[DescriptorBindingDesc],
    sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        let count = b.count * sets;
        match sizes.iter_mut().find(|s| s.ty == b.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(b.descriptor_type)
                    .descriptor_count(count),
            ),
        }
    }
    sizes
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: create_info borrows vk_bindings for the duration of the
        // call.
        let handle = unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;

        // SAFETY: handle is a valid layout created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name descriptor set layout {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
        })
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent; pipeline layouts built on
        // it keep no reference after creation.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// An owned `VkDescriptorPool`. Sets are never freed individually; the
/// whole pool is [`reset`](Self::reset) instead.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
    max_sets: u32,
    allocated: u32,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("allocated", &self.allocated)
            .field("max_sets", &self.max_sets)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        // SAFETY: create_info references only stack data.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;

        // SAFETY: handle is a valid pool created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name descriptor pool {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            max_sets,
            allocated: 0,
        })
    }

    /// Allocate one set per layout.
    ///
    /// Returns `ERROR_OUT_OF_POOL_MEMORY` without calling the driver when
    /// the pool's set budget is exhausted.
    pub fn allocate_sets(
        &mut self,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<DescriptorSet>, vk::Result> {
        let requested = layouts.len() as u32;
        if self.allocated + requested > self.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let raw_layouts: Vec<vk::DescriptorSetLayout> = layouts
            .iter()
            .map(|l| l.raw_descriptor_set_layout())
            .collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&raw_layouts);
        // SAFETY: the pool and every layout were created from self.parent.
        let raw_sets = unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }?;
        self.allocated += requested;
        Ok(raw_sets
            .into_iter()
            .map(|handle| DescriptorSet { handle })
            .collect())
    }

    /// Return every set to the pool.
    ///
    /// # Safety
    /// No submitted work may still use a set from this pool, and no
    /// [`DescriptorSet`] from it may be used afterwards.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the sets are idle and abandoned.
        unsafe { self.parent.reset_raw_descriptor_pool(self.handle) }?;
        self.allocated = 0;
        Ok(())
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: handle was created from parent; the owner waits for the
        // GPU before dropping frame resources.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A set allocated from a [`DescriptorPool`]. Does not own its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }
}

enum PendingWrite {
    Buffer {
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
}

/// Batched descriptor updates.
#[derive(Default)]
pub struct DescriptorWrites {
    writes: Vec<PendingWrite>,
}

impl DescriptorWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniform_buffer(
        &mut self,
        set: &DescriptorSet,
        binding: u32,
        buffer: &impl BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.buffer(set, binding, vk::DescriptorType::UNIFORM_BUFFER, buffer, offset, range)
    }

    pub fn storage_buffer(
        &mut self,
        set: &DescriptorSet,
        binding: u32,
        buffer: &impl BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.buffer(set, binding, vk::DescriptorType::STORAGE_BUFFER, buffer, offset, range)
    }

    fn buffer(
        &mut self,
        set: &DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: &impl BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.writes.push(PendingWrite::Buffer {
            set: set.handle,
            binding,
            ty,
            info: vk::DescriptorBufferInfo::default()
                .buffer(buffer.raw_buffer())
                .offset(offset)
                .range(range),
        });
        self
    }

    pub fn combined_image_sampler(
        &mut self,
        set: &DescriptorSet,
        binding: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        image_layout: vk::ImageLayout,
    ) -> &mut Self {
        self.writes.push(PendingWrite::Image {
            set: set.handle,
            binding,
            info: vk::DescriptorImageInfo::default()
                .image_view(image_view)
                .sampler(sampler)
                .image_layout(image_layout),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every queued write.
    ///
    /// # Safety
    /// Every referenced handle must come from `device`, outlive any use of
    /// the sets by submitted work, and the target sets must not be in use
    /// by pending GPU work.
    pub unsafe fn apply(&self, device: &Device) {
        if self.writes.is_empty() {
            return;
        }
        let vk_writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .map(|w| match w {
                PendingWrite::Buffer {
                    set,
                    binding,
                    ty,
                    info,
                } => vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info)),
                PendingWrite::Image { set, binding, info } => {
                    vk::WriteDescriptorSet::default()
                        .dst_set(*set)
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(info))
                }
            })
            .collect();
        // SAFETY: caller guarantees handle validity and idleness.
        unsafe { device.update_raw_descriptor_sets(&vk_writes) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ash::vk::Handle;

    fn binding(binding: u32, ty: vk::DescriptorType, count: u32) -> DescriptorBindingDesc {
        DescriptorBindingDesc {
            binding,
            descriptor_type: ty,
            count,
            stage_flags: vk::ShaderStageFlags::ALL,
        }
    }

    #[test]
    fn pool_sizes_merge_by_type() {
        let bindings = [
            binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1),
            binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            binding(2, vk::DescriptorType::UNIFORM_BUFFER, 2),
        ];
        let sizes = pool_sizes_for(&bindings, 10);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[1].descriptor_count, 10);
    }

    #[test]
    fn writes_batch_in_order() {
        struct Fake(vk::Buffer);
        impl BufferHandle for Fake {
            fn raw_buffer(&self) -> vk::Buffer {
                self.0
            }
        }
        let set = DescriptorSet {
            handle: vk::DescriptorSet::from_raw(7),
        };
        let mut writes = DescriptorWrites::new();
        assert!(writes.is_empty());
        writes
            .uniform_buffer(&set, 0, &Fake(vk::Buffer::from_raw(1)), 0, 64)
            .combined_image_sampler(
                &set,
                8,
                vk::ImageView::from_raw(2),
                vk::Sampler::from_raw(3),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        assert_eq!(writes.len(), 2);
        assert!(matches!(
            writes.writes[0],
            PendingWrite::Buffer { binding: 0, ty: vk::DescriptorType::UNIFORM_BUFFER, .. }
        ));
        assert!(matches!(writes.writes[1], PendingWrite::Image { binding: 8, .. }));
    }
}
