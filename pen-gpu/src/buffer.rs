//! GPU buffers and the [`BufferHandle`] trait.
//!
//! - [`HostVisibleBuffer`]: mapped memory, either written by the CPU
//!   (`CpuToGpu`: staging, dynamic constant/vertex data) or read back by it
//!   (`GpuToCpu`).
//! - [`DeviceLocalBuffer`]: GPU-only memory filled through a recorded
//!   copy from a host-visible buffer.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::device::{Device, MemoryUsage};

/// Types that expose a raw `VkBuffer`.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }
}

impl BufferHandle for vk::Buffer {
    fn raw_buffer(&self) -> vk::Buffer {
        *self
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Buffer size must be non-zero")]
    ZeroSize,

    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum MappedAccessError {
    #[error(
        "Access of {len} bytes at offset {offset} exceeds buffer size \
         ({buffer_bytes} bytes)"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error("Vulkan error flushing or invalidating mapped memory: {0}")]
    SyncMemory(vk::Result),

    #[error("Allocation is not host-mapped")]
    NotMapped,
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Copy region out of bounds: src(size={src_size}, offset={src_offset}), \
         dst(size={dst_size}, offset={dst_offset}), copy={copy_size}"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },
}

/// The atom-aligned `(offset, size)` covering `[offset, offset + len)` of an
/// allocation, clamped to the allocation's end.
fn atom_aligned_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    atom: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = offset / atom * atom;
    let end = (offset + len).div_ceil(atom) * atom;
    (start, end.min(allocation_size) - start)
}

fn check_region(
    src_size: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
    copy_size: vk::DeviceSize,
) -> Result<(), UploadBufferError> {
    if src_offset.saturating_add(copy_size) > src_size
        || dst_offset.saturating_add(copy_size) > dst_size
    {
        return Err(UploadBufferError::RegionOutOfBounds {
            src_size,
            src_offset,
            dst_size,
            dst_offset,
            copy_size,
        });
    }
    Ok(())
}

struct AllocatedBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl AllocatedBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
        memory_usage: MemoryUsage,
    ) -> Result<Self, CreateBufferError> {
        if size == 0 {
            return Err(CreateBufferError::ZeroSize);
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        // SAFETY: handle is a valid buffer created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name buffer {:?}: {e}", handle);
        }

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("buffer"), reqs, memory_usage, true)
            .map_err(|e| {
                // SAFETY: handle is unbound and unused.
                unsafe { device.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation belong to this device.
        let bind_result = unsafe {
            device.bind_raw_buffer_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope and unused.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
        })
    }

    fn allocation(&self) -> Result<&Allocation, MappedAccessError> {
        self.allocation.as_ref().ok_or(MappedAccessError::NotMapped)
    }

    fn check_access(
        &self,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<(), MappedAccessError> {
        if offset.saturating_add(len as vk::DeviceSize) > self.size {
            return Err(MappedAccessError::OutOfBounds {
                offset,
                len,
                buffer_bytes: self.size,
            });
        }
        Ok(())
    }

    /// Flush (`write == true`) or invalidate the mapped range when the
    /// memory is not host-coherent.
    fn sync_range(
        &self,
        offset: vk::DeviceSize,
        len: usize,
        write: bool,
    ) -> Result<(), MappedAccessError> {
        let allocation = self.allocation()?;
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if coherent || len == 0 {
            return Ok(());
        }
        let atom = self.parent.non_coherent_atom_size();
        // Device::allocate_memory aligns offset and size of non-coherent
        // allocations to the atom.
        debug_assert_eq!(allocation.offset() % atom, 0);
        let (start, size) =
            atom_aligned_range(offset, len as vk::DeviceSize, atom, allocation.size());
        let range = vk::MappedMemoryRange::default()
            // SAFETY: the allocation is live while self is.
            .memory(unsafe { allocation.memory() })
            .offset(allocation.offset() + start)
            .size(size);
        // SAFETY: range lies inside a mapped allocation of this device and is
        // atom aligned.
        unsafe {
            if write {
                self.parent
                    .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            } else {
                self.parent
                    .invalidate_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            }
        }
        .map_err(MappedAccessError::SyncMemory)
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this wrapper.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

/// A mapped buffer, CPU-written (`CpuToGpu`) or CPU-read (`GpuToCpu`).
#[derive(Debug)]
pub struct HostVisibleBuffer {
    inner: AllocatedBuffer,
}

impl HostVisibleBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                name,
                MemoryUsage::CpuToGpu,
            )?,
        })
    }

    /// A `TRANSFER_DST` buffer in host-cached memory for read-back.
    pub fn new_readback(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                vk::BufferUsageFlags::TRANSFER_DST,
                name,
                MemoryUsage::GpuToCpu,
            )?,
        })
    }

    /// Copy `bytes` into the buffer at `offset` and flush if needed.
    ///
    /// The caller must not overwrite a range the GPU is still reading.
    pub fn write_bytes(
        &mut self,
        offset: vk::DeviceSize,
        bytes: &[u8],
    ) -> Result<(), MappedAccessError> {
        self.inner.check_access(offset, bytes.len())?;
        let mapped_ptr = self
            .inner
            .allocation()?
            .mapped_ptr()
            .ok_or(MappedAccessError::NotMapped)?;

        // SAFETY: mapped_ptr points to host-visible memory of at least
        // self.size bytes and the range was bounds-checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr().cast::<u8>().add(offset as usize),
                bytes.len(),
            );
        }
        self.inner.sync_range(offset, bytes.len(), true)
    }

    /// Copy the whole buffer out, invalidating non-coherent memory first.
    ///
    /// The caller must have waited for any GPU write into the buffer.
    pub fn read_bytes(&self) -> Result<Vec<u8>, MappedAccessError> {
        let len = self.inner.size as usize;
        self.inner.sync_range(0, len, false)?;
        let mapped_ptr = self
            .inner
            .allocation()?
            .mapped_ptr()
            .ok_or(MappedAccessError::NotMapped)?;
        let mut out = vec![0u8; len];
        // SAFETY: the mapping covers self.size bytes and out has that
        // length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped_ptr.as_ptr().cast::<u8>(),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }
}

impl BufferHandle for HostVisibleBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

/// A GPU-only buffer.
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    inner: AllocatedBuffer,
}

impl DeviceLocalBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(
                device,
                size,
                usage,
                name,
                MemoryUsage::GpuOnly,
            )?,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }

    /// Record a copy of `copy_size` bytes from `src` into this buffer.
    ///
    /// # Safety
    /// - `command_buffer` must be recording outside a render pass.
    /// - `src` (with `TRANSFER_SRC`) and `self` (with `TRANSFER_DST`) must
    ///   stay alive until the copy has executed.
    pub unsafe fn record_copy_from(
        &mut self,
        command_buffer: &mut CommandBuffer,
        src: &impl BufferHandle,
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    ) -> Result<(), UploadBufferError> {
        check_region(src_size, src_offset, self.size(), dst_offset, copy_size)?;
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(copy_size);
        // SAFETY: caller guarantees recording state; the region is in
        // bounds of both buffers.
        unsafe {
            command_buffer.copy_buffer(
                src.raw_buffer(),
                self.raw_buffer(),
                std::slice::from_ref(&region),
            )
        };
        Ok(())
    }
}

impl BufferHandle for DeviceLocalBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_range_rounds_outwards() {
        assert_eq!(atom_aligned_range(0, 10, 64, 256), (0, 64));
        assert_eq!(atom_aligned_range(70, 10, 64, 256), (64, 64));
        assert_eq!(atom_aligned_range(60, 10, 64, 256), (0, 128));
    }

    #[test]
    fn atom_range_clamps_to_allocation_end() {
        assert_eq!(atom_aligned_range(200, 50, 64, 256), (192, 64));
        assert_eq!(atom_aligned_range(0, 100, 1, 100), (0, 100));
    }

    #[test]
    fn copy_regions_are_bounds_checked() {
        assert!(check_region(64, 0, 64, 0, 64).is_ok());
        assert!(check_region(64, 32, 128, 96, 32).is_ok());
        assert!(matches!(
            check_region(64, 32, 128, 0, 64),
            Err(UploadBufferError::RegionOutOfBounds { copy_size: 64, .. })
        ));
        assert!(check_region(64, 0, 16, 0, 32).is_err());
        assert!(check_region(u64::MAX, u64::MAX, u64::MAX, 0, 2).is_err());
    }
}
