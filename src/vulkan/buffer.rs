use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use ash::{self, vk};

use crate::error::RenderError;
use crate::vulkan::command_buffer::{CommandContext, CompletionToken};
use crate::vulkan::context::Context;

pub struct UntypedBuffer {
    pub inner: vk::Buffer,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::DeviceMemory,
    /// Logical size in bytes; the underlying allocation may be larger.
    pub size: vk::DeviceSize,
    pub memory_flags: vk::MemoryPropertyFlags,
    context: Arc<Context>,
}

impl UntypedBuffer {
    pub fn get_device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe {
            self.context
                .buffer_device_address
                .get_buffer_device_address(&info)
        }
    }
}

/// A typed view over one exclusively-owned device allocation. The allocation
/// is destroyed exactly once, when the last reference drops.
pub struct Buffer<T> {
    inner: Arc<UntypedBuffer>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Buffer<T> {
    pub fn new(
        context: Arc<Context>,
        len: usize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer<T>, RenderError> {
        let device = &context.device;
        let size = byte_size::<T>(len);

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None) }?;

        let buffer_memory_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let buffer_memorytype_index = find_memorytype_index(
            &buffer_memory_requirements,
            &context.device_memory_properties,
            memory_flags,
        )
        .ok_or(RenderError::OutOfDeviceMemory { size })?;

        let mut allocate_flags_info =
            vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

        let mut allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(buffer_memory_requirements.size)
            .memory_type_index(buffer_memorytype_index);
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            allocate_info = allocate_info.push_next(&mut allocate_flags_info);
        }

        let memory = match unsafe { device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(RenderError::OutOfDeviceMemory { size });
            }
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err.into());
            }
        };

        unsafe { device.bind_buffer_memory(buffer, memory, 0) }?;

        let untyped = Arc::new(UntypedBuffer {
            inner: buffer,
            usage,
            memory,
            size,
            memory_flags,
            context,
        });
        Ok(Buffer {
            inner: untyped,
            len,
            _marker: PhantomData,
        })
    }

    pub fn get_vk_buffer(&self) -> vk::Buffer {
        self.inner.inner
    }

    fn get_device(&self) -> &ash::Device {
        &self.inner.context.device
    }

    pub fn get_device_address(&self) -> vk::DeviceAddress {
        self.inner.get_device_address()
    }

    /// Number of `T` elements this buffer was allocated for.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Logical size in bytes, exactly `len * size_of::<T>()`.
    pub fn byte_size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    /// Writes `data` through a host mapping. The buffer must be host-visible.
    pub fn copy_data(&self, data: &[T]) -> Result<(), RenderError>
    where
        T: Copy,
    {
        assert!(data.len() <= self.len, "data exceeds buffer capacity");
        ensure_mappable(self.inner.memory_flags)?;

        let buffer_ptr = unsafe {
            self.get_device().map_memory(
                self.inner.memory,
                0,
                self.inner.size,
                vk::MemoryMapFlags::empty(),
            )
        }? as *mut T;

        unsafe { buffer_ptr.copy_from_nonoverlapping(data.as_ptr(), data.len()) };

        unsafe { self.get_device().unmap_memory(self.inner.memory) };
        Ok(())
    }

    /// Maps the buffer for host reads. Fails with `InvalidAccess` for
    /// device-local buffers; the mapping is released when the guard drops,
    /// so map and unmap always pair.
    pub fn map(&self) -> Result<MappedMemory<'_, T>, RenderError> {
        ensure_mappable(self.inner.memory_flags)?;

        let ptr = unsafe {
            self.get_device().map_memory(
                self.inner.memory,
                0,
                self.inner.size,
                vk::MemoryMapFlags::empty(),
            )
        }? as *const T;

        Ok(MappedMemory {
            ptr,
            len: self.len,
            buffer: &self.inner,
        })
    }
}

/// RAII view of a mapped buffer; exposes exactly the logical element range.
pub struct MappedMemory<'a, T> {
    ptr: *const T,
    len: usize,
    buffer: &'a UntypedBuffer,
}

impl<T> Deref for MappedMemory<'_, T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> Drop for MappedMemory<'_, T> {
    fn drop(&mut self) {
        unsafe { self.buffer.context.device.unmap_memory(self.buffer.memory) };
    }
}

impl Drop for UntypedBuffer {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_buffer(self.inner, None) };
        unsafe { device.free_memory(self.memory, None) };
    }
}

/// One batch of host-to-device uploads routed through staging buffers.
/// Destination buffers are only valid once the recording context's
/// submission has completed; `finish` demands the completion token so the
/// staging memory cannot be released earlier.
pub struct StagedUploads {
    staging: Vec<Arc<UntypedBuffer>>,
}

impl StagedUploads {
    pub fn new() -> Self {
        Self {
            staging: Vec::new(),
        }
    }

    /// Creates a device-local buffer sized to `data` and records the
    /// staging copy into `ctx`.
    pub fn upload<T: Copy>(
        &mut self,
        ctx: &mut CommandContext<'_>,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer<T>, RenderError> {
        let context = ctx.context().clone();

        let device_buffer: Buffer<T> = Buffer::new(
            context.clone(),
            data.len(),
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let staging_buffer: Buffer<T> = Buffer::new(
            context.clone(),
            data.len(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging_buffer.copy_data(data)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging_buffer.byte_size(),
        };
        unsafe {
            context.device.cmd_copy_buffer(
                ctx.raw(),
                staging_buffer.get_vk_buffer(),
                device_buffer.get_vk_buffer(),
                std::slice::from_ref(&region),
            )
        };

        self.staging.push(staging_buffer.inner.clone());
        Ok(device_buffer)
    }

    /// Releases all staging memory of this batch. Requires the token of the
    /// submission that carried the copies.
    pub fn finish(self, _uploads_complete: &CompletionToken) {
        drop(self.staging);
    }
}

pub(crate) fn byte_size<T>(len: usize) -> vk::DeviceSize {
    (len * std::mem::size_of::<T>()) as vk::DeviceSize
}

pub(crate) fn ensure_mappable(memory_flags: vk::MemoryPropertyFlags) -> Result<(), RenderError> {
    if memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        Ok(())
    } else {
        Err(RenderError::InvalidAccess)
    }
}

fn find_memorytype_index(
    memory_req: &vk::MemoryRequirements,
    memory_prop: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_prop.memory_types[..memory_prop.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (memory_req.memory_type_bits & (1 << index)) != 0
                && memory_type.property_flags & flags == flags
        })
        .map(|(index, _memory_type)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_requires_host_visibility() {
        assert!(ensure_mappable(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        )
        .is_ok());

        let err = ensure_mappable(vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(err, RenderError::InvalidAccess));
    }

    #[test]
    fn byte_size_is_exact() {
        assert_eq!(byte_size::<f32>(800 * 600 * 3), 800 * 600 * 3 * 4);
        assert_eq!(byte_size::<u32>(3), 12);
        assert_eq!(byte_size::<u8>(17), 17);
    }
}
