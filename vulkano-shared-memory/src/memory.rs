//! The device-local buffer mirroring guest physical memory, and the memory bound to it.

use crate::{
    device::{find_memory_type_index, DeviceFunctions},
    DeviceSize,
};
use ash::vk;
use smallvec::SmallVec;
use std::{error::Error, fmt};

/// Size of every device memory allocation backing a sparse buffer.
pub const SPARSE_ALLOCATION_SIZE: DeviceSize = 4 << 20;

/// How device memory is attached to the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// The buffer is created with sparse binding and residency, and is backed by several
    /// [`SPARSE_ALLOCATION_SIZE`] allocations. Requires the `sparse_binding` and
    /// `sparse_residency_buffer` features.
    Sparse,
    /// One allocation covering the whole buffer, bound with `vkBindBufferMemory`.
    Plain,
}

impl AllocationStrategy {
    #[inline]
    pub fn buffer_create_flags(self) -> vk::BufferCreateFlags {
        match self {
            AllocationStrategy::Sparse => {
                vk::BufferCreateFlags::SPARSE_BINDING | vk::BufferCreateFlags::SPARSE_RESIDENCY
            }
            AllocationStrategy::Plain => vk::BufferCreateFlags::empty(),
        }
    }
}

/// The buffer that holds the device copy of guest memory.
#[derive(Debug)]
pub struct BackingStore {
    buffer: vk::Buffer,
    size: DeviceSize,
    memory: SmallVec<[vk::DeviceMemory; 1]>,
    memory_type_index: u32,
    strategy: AllocationStrategy,
}

impl BackingStore {
    pub const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
        vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
            | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
            | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
            | vk::BufferUsageFlags::INDEX_BUFFER.as_raw(),
    );

    /// Creates the buffer with the first of `strategies` that works on the device.
    ///
    /// `device_local_memory_types` is the mask of memory type indices that are device-local.
    /// Each failed attempt is cleaned up before the next one is made, and the error of the last
    /// attempt is returned if none succeeds.
    pub unsafe fn new<D>(
        device: &D,
        size: DeviceSize,
        strategies: &[AllocationStrategy],
        device_local_memory_types: u32,
    ) -> Result<Self, BackingStoreCreationError>
    where
        D: DeviceFunctions + ?Sized,
    {
        let mut last_error = None;

        for &strategy in strategies {
            let result = unsafe {
                BackingStore::with_strategy(device, size, strategy, device_local_memory_types)
            };

            match result {
                Ok(store) => {
                    tracing::debug!(
                        "Shared memory: {} MB buffer created with the {:?} strategy using memory \
                        type {}",
                        size >> 20,
                        strategy,
                        store.memory_type_index,
                    );

                    return Ok(store);
                }
                Err(err) => {
                    tracing::debug!(
                        "Shared memory: {:?} buffer allocation strategy failed: {}",
                        strategy,
                        err,
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(BackingStoreCreationError::BufferCreation(
            vk::Result::ERROR_INITIALIZATION_FAILED,
        )))
    }

    /// Makes a single attempt at creating the buffer with `strategy`. Nothing is leaked if the
    /// attempt fails.
    pub unsafe fn with_strategy<D>(
        device: &D,
        size: DeviceSize,
        strategy: AllocationStrategy,
        device_local_memory_types: u32,
    ) -> Result<Self, BackingStoreCreationError>
    where
        D: DeviceFunctions + ?Sized,
    {
        let create_info = vk::BufferCreateInfo::default()
            .flags(strategy.buffer_create_flags())
            .size(size)
            .usage(BackingStore::USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info) }
            .map_err(BackingStoreCreationError::BufferCreation)?;

        let mut store = BackingStore {
            buffer,
            size,
            memory: SmallVec::new(),
            memory_type_index: 0,
            strategy,
        };

        match unsafe { store.bind_memory(device, device_local_memory_types) } {
            Ok(()) => Ok(store),
            Err(err) => {
                unsafe { store.destroy(device) };

                Err(err)
            }
        }
    }

    unsafe fn bind_memory<D>(
        &mut self,
        device: &D,
        device_local_memory_types: u32,
    ) -> Result<(), BackingStoreCreationError>
    where
        D: DeviceFunctions + ?Sized,
    {
        let requirements = unsafe { device.buffer_memory_requirements(self.buffer) };
        self.memory_type_index =
            find_memory_type_index(requirements.memory_type_bits, device_local_memory_types, 0)
                .ok_or(BackingStoreCreationError::NoDeviceLocalMemoryType)?;

        match self.strategy {
            AllocationStrategy::Plain => {
                let memory = unsafe { self.allocate(device, requirements.size) }?;

                unsafe { device.bind_buffer_memory(self.buffer, memory, 0) }
                    .map_err(BackingStoreCreationError::MemoryBinding)?;
            }
            AllocationStrategy::Sparse => {
                let allocation_size =
                    align_up(SPARSE_ALLOCATION_SIZE, requirements.alignment.max(1));
                let mut binds: SmallVec<[vk::SparseMemoryBind; 8]> = SmallVec::new();
                let mut offset = 0;

                while offset < requirements.size {
                    let size = allocation_size.min(requirements.size - offset);
                    let memory = unsafe { self.allocate(device, size) }?;

                    binds.push(
                        vk::SparseMemoryBind::default()
                            .resource_offset(offset)
                            .size(size)
                            .memory(memory)
                            .memory_offset(0),
                    );
                    offset += size;
                }

                unsafe { device.bind_sparse_buffer_memory(self.buffer, &binds) }
                    .map_err(BackingStoreCreationError::MemoryBinding)?;
            }
        }

        Ok(())
    }

    unsafe fn allocate<D>(
        &mut self,
        device: &D,
        size: DeviceSize,
    ) -> Result<vk::DeviceMemory, BackingStoreCreationError>
    where
        D: DeviceFunctions + ?Sized,
    {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index);
        let memory = unsafe { device.allocate_memory(&allocate_info) }
            .map_err(BackingStoreCreationError::MemoryAllocation)?;
        self.memory.push(memory);

        Ok(memory)
    }

    /// Destroys the buffer and frees every allocation backing it. The device must no longer be
    /// using the buffer.
    pub unsafe fn destroy<D>(&mut self, device: &D)
    where
        D: DeviceFunctions + ?Sized,
    {
        if self.buffer != vk::Buffer::null() {
            unsafe { device.destroy_buffer(self.buffer) };
            self.buffer = vk::Buffer::null();
        }

        for memory in self.memory.drain(..) {
            unsafe { device.free_memory(memory) };
        }
    }

    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    #[inline]
    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the number of device memory allocations backing the buffer.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.memory.len()
    }
}

/// Error that can happen when creating a [`BackingStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingStoreCreationError {
    BufferCreation(vk::Result),
    /// None of the memory types the buffer can be bound to is device-local.
    NoDeviceLocalMemoryType,
    MemoryAllocation(vk::Result),
    MemoryBinding(vk::Result),
}

impl fmt::Display for BackingStoreCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BufferCreation(_) => "failed to create the buffer",
            Self::NoDeviceLocalMemoryType => {
                "no device-local memory type is compatible with the buffer"
            }
            Self::MemoryAllocation(_) => "failed to allocate memory for the buffer",
            Self::MemoryBinding(_) => "failed to bind memory to the buffer",
        };

        f.write_str(msg)
    }
}

impl Error for BackingStoreCreationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BufferCreation(err) | Self::MemoryAllocation(err) | Self::MemoryBinding(err) => {
                Some(err)
            }
            Self::NoDeviceLocalMemoryType => None,
        }
    }
}

#[inline]
pub(crate) const fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    (value + alignment - 1) / alignment * alignment
}
