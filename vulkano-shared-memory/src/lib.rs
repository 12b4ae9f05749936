//! A device-local mirror of the guest's physical memory for Vulkan renderers of emulated
//! consoles.
//!
//! The whole guest physical address space is exposed to shaders as a single buffer, the
//! [shared memory]. Guest pages are copied into it on demand through host-visible staging pages,
//! and every change in the way the device accesses the buffer is guarded by a pipeline barrier.
//!
//! Deciding *which* pages are stale is left to the caller. Once it has a sorted list of dirty
//! page ranges, it hands them to [`SharedMemory::upload_ranges`], which marks them valid in the
//! caller's [`ValidityTracker`] and records the copies into a [`CommandSink`].
//!
//! Before the device touches the buffer in any other way, [`SharedMemory::declare_access`] must
//! be called with the kind of access that is about to happen. It records the barrier, if any,
//! that makes the preceding writes visible to that access.
//!
//! [shared memory]: SharedMemory

pub use self::{
    access::{AccessMode, AccessState, AccessTransition, SyncScope},
    command_buffer::{
        BufferCopy, BufferMemoryBarrier, CommandSink, DeferredCommand, DeferredCommandBuffer,
    },
    device::{DeviceFunctions, MemoryTypes, VulkanDevice},
    memory::{AllocationStrategy, BackingStore, BackingStoreCreationError, SPARSE_ALLOCATION_SIZE},
    staging::{
        StagingAllocation, StagingError, StagingPool, StagingPoolCreateInfo,
        DEFAULT_STAGING_PAGE_SIZE,
    },
    upload::{PageRange, UploadContext, UploadError},
};
use ash::vk;
use std::{fmt, ops::Range, sync::Arc};

pub mod access;
pub mod command_buffer;
pub mod device;
pub mod memory;
pub mod staging;
#[cfg(test)]
mod tests;
mod upload;

/// Represents memory size and offset values on a Vulkan device.
pub type DeviceSize = u64;

/// The size of the guest physical address space mirrored by the shared memory.
pub const SHARED_MEMORY_SIZE: DeviceSize = 512 << 20;

/// Parameters to create a new [`SharedMemory`].
#[derive(Clone, Debug)]
pub struct SharedMemoryCreateInfo {
    /// The binary logarithm of the guest page size, which is the granularity of uploads.
    ///
    /// The default value is `12`.
    pub page_size_log2: u32,

    /// The memory types of the physical device.
    ///
    /// The default value is empty, which must be overridden.
    pub memory_types: MemoryTypes,

    /// Whether the `tessellation_shader` feature is enabled on the device. If it is, the
    /// tessellation evaluation stage is included in the barriers for guest draws.
    ///
    /// The default value is `false`.
    pub tessellation_shader: bool,

    /// Whether the `sparse_binding` and `sparse_residency_buffer` features are enabled on the
    /// device. If they are, a sparse buffer is tried first, falling back to a plain one.
    ///
    /// The default value is `false`.
    pub sparse_binding: bool,

    /// The size of each staging page. It is aligned up to the guest page size.
    ///
    /// The default value is [`DEFAULT_STAGING_PAGE_SIZE`].
    pub staging_page_size: DeviceSize,

    /// The maximum number of staging pages that may exist at a time.
    ///
    /// The default value is `None`.
    pub max_staging_pages: Option<usize>,

    /// The device's `nonCoherentAtomSize` limit.
    ///
    /// The default value is `256`.
    pub non_coherent_atom_size: DeviceSize,
}

impl Default for SharedMemoryCreateInfo {
    #[inline]
    fn default() -> Self {
        SharedMemoryCreateInfo {
            page_size_log2: 12,
            memory_types: MemoryTypes::default(),
            tessellation_shader: false,
            sparse_binding: false,
            staging_page_size: DEFAULT_STAGING_PAGE_SIZE,
            max_staging_pages: None,
            non_coherent_atom_size: 256,
        }
    }
}

/// The submission counters of the command processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmissionCounters {
    /// The submission that commands are currently being recorded for.
    pub current: u64,
    /// The latest submission known to have completed on the device.
    pub completed: u64,
}

/// Access to the guest's physical memory on the host.
pub trait GuestMemory {
    /// Returns the `length` bytes of guest physical memory starting at `address`.
    fn translate_physical(&self, address: u32, length: usize) -> &[u8];
}

impl GuestMemory for [u8] {
    #[inline]
    fn translate_physical(&self, address: u32, length: usize) -> &[u8] {
        &self[address as usize..][..length]
    }
}

impl GuestMemory for Vec<u8> {
    #[inline]
    fn translate_physical(&self, address: u32, length: usize) -> &[u8] {
        self.as_slice().translate_physical(address, length)
    }
}

/// Bookkeeping of which parts of the shared memory hold up-to-date guest data.
pub trait ValidityTracker {
    /// Marks `length` bytes starting at `start` as up to date.
    ///
    /// `post_copy` is set when the data has already reached the buffer, as opposed to being
    /// claimed ahead of a copy.
    fn mark_range_valid(&mut self, start: u32, length: u32, post_copy: bool);
}

/// Receives notifications about guest memory the renderer reads, for trace capture.
pub trait TraceWriter {
    fn write_memory_read(&mut self, address: u32, length: u32);
}

impl TraceWriter for () {
    #[inline]
    fn write_memory_read(&mut self, _address: u32, _length: u32) {}
}

/// A [`TraceWriter`] that emits the reads as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn write_memory_read(&mut self, address: u32, length: u32) {
        tracing::trace!(address, length, "guest memory read");
    }
}

/// The device copy of guest physical memory.
pub struct SharedMemory<D>
where
    D: DeviceFunctions + ?Sized,
{
    device: Arc<D>,
    backing_store: Option<BackingStore>,
    staging_pool: Option<StagingPool>,
    access: AccessState,
    page_size_log2: u32,
    tessellation_shader: bool,
}

impl<D> SharedMemory<D>
where
    D: DeviceFunctions + ?Sized,
{
    /// Creates the shared memory buffer and its staging pool.
    ///
    /// # Safety
    ///
    /// - `create_info.memory_types` must describe the memory types of `device`.
    /// - `create_info.tessellation_shader` and `create_info.sparse_binding` must only be set if
    ///   the corresponding features are enabled on `device`.
    /// - The device must have finished using the buffer and the staging pages when the shared
    ///   memory is shut down or dropped.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.page_size_log2` is not in the range `0..=30`.
    pub unsafe fn new(
        device: Arc<D>,
        create_info: SharedMemoryCreateInfo,
    ) -> Result<Self, BackingStoreCreationError> {
        let SharedMemoryCreateInfo {
            page_size_log2,
            memory_types,
            tessellation_shader,
            sparse_binding,
            staging_page_size,
            max_staging_pages,
            non_coherent_atom_size,
        } = create_info;

        assert!(page_size_log2 <= 30);

        let strategies: &[AllocationStrategy] = if sparse_binding {
            &[AllocationStrategy::Sparse, AllocationStrategy::Plain]
        } else {
            &[AllocationStrategy::Plain]
        };

        let backing_store = unsafe {
            BackingStore::new(
                &*device,
                SHARED_MEMORY_SIZE,
                strategies,
                memory_types.device_local,
            )
        }
        .inspect_err(|err| {
            tracing::error!(
                "Shared memory: Failed to create the {} MB Vulkan buffer: {}",
                SHARED_MEMORY_SIZE >> 20,
                err,
            );
        })?;

        let page_size = 1 << page_size_log2;
        let staging_pool = StagingPool::new(StagingPoolCreateInfo {
            page_size: memory::align_up(staging_page_size.max(1), page_size),
            host_visible_memory_types: memory_types.host_visible,
            host_coherent_memory_types: memory_types.host_coherent,
            non_coherent_atom_size,
            max_pages: max_staging_pages,
        });

        Ok(SharedMemory {
            device,
            backing_store: Some(backing_store),
            staging_pool: Some(staging_pool),
            access: AccessState::new(SHARED_MEMORY_SIZE),
            page_size_log2,
            tessellation_shader,
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns the shared memory buffer, or a null handle after [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.backing_store
            .as_ref()
            .map_or(vk::Buffer::null(), BackingStore::buffer)
    }

    #[inline]
    pub fn backing_store(&self) -> Option<&BackingStore> {
        self.backing_store.as_ref()
    }

    #[inline]
    pub fn staging_pool(&self) -> Option<&StagingPool> {
        self.staging_pool.as_ref()
    }

    #[inline]
    pub fn buffer_size(&self) -> DeviceSize {
        SHARED_MEMORY_SIZE
    }

    #[inline]
    pub fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    /// Returns the most recently declared access.
    #[inline]
    pub fn current_access(&self) -> AccessMode {
        self.access.current()
    }

    /// Returns the range written by the most recently declared access, which has not been made
    /// visible to other accesses yet.
    #[inline]
    pub fn pending_write_range(&self) -> Range<DeviceSize> {
        self.access.pending_write()
    }

    /// Declares that the commands recorded next access the buffer in `mode`, writing
    /// `written_range`, and records the barrier needed before them into `commands`.
    ///
    /// `written_range` is clamped to the size of the buffer.
    ///
    /// # Panics
    ///
    /// - Panics if `mode` is [`AccessMode::Read`] and `written_range` is not empty.
    pub fn declare_access(
        &mut self,
        commands: &mut dyn CommandSink,
        mode: AccessMode,
        written_range: Range<DeviceSize>,
    ) {
        let Some(transition) = self.access.declare(mode, written_range) else {
            return;
        };

        let src = transition.src_mode.sync_scope(self.tessellation_shader);
        let dst = transition.dst_mode.sync_scope(self.tessellation_shader);

        commands.pipeline_barrier(&BufferMemoryBarrier {
            src_stages: src.stages,
            src_access: src.access,
            dst_stages: dst.stages,
            dst_access: dst.access,
            buffer: self.buffer(),
            offset: transition.range.start,
            size: transition.range.end - transition.range.start,
        });
    }

    /// Makes the staging pages of every submission up to `submissions.completed` reusable.
    pub fn on_submission_completed(&mut self, submissions: SubmissionCounters) {
        if let Some(staging_pool) = &mut self.staging_pool {
            staging_pool.reclaim(submissions.completed);
        }
    }

    /// Flushes the staging writes made for the submission that is about to be submitted.
    pub fn on_submission_ended(&mut self) -> Result<(), StagingError> {
        let Some(staging_pool) = &mut self.staging_pool else {
            return Ok(());
        };

        unsafe { staging_pool.flush_writes(&*self.device) }.inspect_err(|err| {
            tracing::error!("Shared memory: Failed to flush the upload buffer writes: {}", err);
        })
    }

    /// Destroys the staging pool and then the buffer. Calling this more than once does nothing.
    pub fn shutdown(&mut self) {
        self.access.reset();

        if let Some(mut staging_pool) = self.staging_pool.take() {
            unsafe { staging_pool.destroy(&*self.device) };
        }

        if let Some(mut backing_store) = self.backing_store.take() {
            unsafe { backing_store.destroy(&*self.device) };
        }
    }
}

impl<D> Drop for SharedMemory<D>
where
    D: DeviceFunctions + ?Sized,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D> fmt::Debug for SharedMemory<D>
where
    D: DeviceFunctions + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("backing_store", &self.backing_store)
            .field("staging_pool", &self.staging_pool)
            .field("access", &self.access)
            .field("page_size_log2", &self.page_size_log2)
            .field("tessellation_shader", &self.tessellation_shader)
            .finish_non_exhaustive()
    }
}
