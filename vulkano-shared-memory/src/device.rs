//! The device entry points the shared memory needs, and their `ash`-backed implementation.
//!
//! Everything that creates, binds or maps Vulkan objects goes through [`DeviceFunctions`], so
//! that the allocation strategies can be exercised without a physical device.

use ash::{prelude::VkResult, vk};
use std::{ffi::c_void, slice};

/// Raw device operations used by the backing store and the staging pool.
///
/// The methods map one-to-one onto Vulkan commands of the same name and carry the same
/// valid-usage requirements.
pub trait DeviceFunctions {
    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory>;

    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Binds `binds` to the sparse `buffer`. The binding must have taken effect on the device
    /// by the time this returns.
    unsafe fn bind_sparse_buffer_memory(
        &self,
        buffer: vk::Buffer,
        binds: &[vk::SparseMemoryBind],
    ) -> VkResult<()>;

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    unsafe fn flush_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> VkResult<()>;
}

/// [`DeviceFunctions`] on top of a loaded `ash::Device`.
pub struct VulkanDevice {
    device: ash::Device,
    sparse_binding_queue: Option<vk::Queue>,
}

impl VulkanDevice {
    /// Wraps `device`. `sparse_binding_queue` must support `SPARSE_BINDING` if given; without
    /// it, sparse binds fail with `ERROR_FEATURE_NOT_PRESENT`.
    #[inline]
    pub fn new(device: ash::Device, sparse_binding_queue: Option<vk::Queue>) -> Self {
        VulkanDevice {
            device,
            sparse_binding_queue,
        }
    }

    #[inline]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl DeviceFunctions for VulkanDevice {
    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(create_info, None) }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory> {
        unsafe { self.device.allocate_memory(allocate_info, None) }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn bind_sparse_buffer_memory(
        &self,
        buffer: vk::Buffer,
        binds: &[vk::SparseMemoryBind],
    ) -> VkResult<()> {
        let Some(queue) = self.sparse_binding_queue else {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        };

        let buffer_bind = vk::SparseBufferMemoryBindInfo::default()
            .buffer(buffer)
            .binds(binds);
        let bind_info =
            vk::BindSparseInfo::default().buffer_binds(slice::from_ref(&buffer_bind));

        // Only done while creating the backing store, so waiting here is acceptable.
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }?;
        let result = unsafe {
            self.device
                .queue_bind_sparse(queue, slice::from_ref(&bind_info), fence)
        }
        .and_then(|()| unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) });
        unsafe { self.device.destroy_fence(fence, None) };

        result
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    unsafe fn flush_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> VkResult<()> {
        unsafe { self.device.flush_mapped_memory_ranges(ranges) }
    }
}

/// Memory type index masks of a physical device, grouped by the properties the shared memory
/// cares about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryTypes {
    pub device_local: u32,
    pub host_visible: u32,
    pub host_coherent: u32,
}

impl MemoryTypes {
    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
        let mut memory_types = MemoryTypes::default();

        for (index, memory_type) in properties.memory_types[..count].iter().enumerate() {
            let bit = 1 << index;
            let flags = memory_type.property_flags;

            if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                memory_types.device_local |= bit;
            }
            if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                memory_types.host_visible |= bit;
            }
            if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                memory_types.host_coherent |= bit;
            }
        }

        memory_types
    }

    pub fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        MemoryTypes::from_properties(&properties)
    }
}

/// Picks the memory type among `memory_type_bits & required` that has the most of `preferred`,
/// lowest index first on ties.
pub(crate) fn find_memory_type_index(
    memory_type_bits: u32,
    required: u32,
    preferred: u32,
) -> Option<u32> {
    let candidates = memory_type_bits & required;

    if candidates & preferred != 0 {
        Some((candidates & preferred).trailing_zeros())
    } else if candidates != 0 {
        Some(candidates.trailing_zeros())
    } else {
        None
    }
}
