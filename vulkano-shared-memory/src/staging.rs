//! Host-visible memory for transfers into the shared memory buffer, recycled once the
//! submissions using it have completed on the device.
//!
//! The pool hands out sub-ranges of fixed-size pages. Every page remembers the latest
//! submission that used it, and is only reused after that submission is known to be complete.

use crate::{
    device::{find_memory_type_index, DeviceFunctions},
    memory::align_up,
    DeviceSize,
};
use ash::vk;
use std::{collections::VecDeque, error::Error, fmt, ptr::NonNull, slice};

/// Default size of a staging page, before aligning it to the upload granularity.
pub const DEFAULT_STAGING_PAGE_SIZE: DeviceSize = 2 << 20;

/// Parameters to create a new [`StagingPool`].
#[derive(Clone, Debug)]
pub struct StagingPoolCreateInfo {
    /// The size of each page. Allocations never cross pages, so this is the upper bound of a
    /// single allocation.
    ///
    /// The default value is [`DEFAULT_STAGING_PAGE_SIZE`].
    pub page_size: DeviceSize,

    /// Mask of the memory type indices that are host-visible.
    ///
    /// The default value is `0`, which must be overridden.
    pub host_visible_memory_types: u32,

    /// Mask of the memory type indices that are host-coherent. These are preferred, and pages
    /// allocated from other types are flushed explicitly.
    ///
    /// The default value is `0`.
    pub host_coherent_memory_types: u32,

    /// The device's `nonCoherentAtomSize` limit.
    ///
    /// The default value is `256`.
    pub non_coherent_atom_size: DeviceSize,

    /// The maximum number of pages the pool may create. Requests that need a new page past this
    /// point fail with [`StagingError::OutOfPages`].
    ///
    /// The default value is `None`.
    pub max_pages: Option<usize>,
}

impl Default for StagingPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        StagingPoolCreateInfo {
            page_size: DEFAULT_STAGING_PAGE_SIZE,
            host_visible_memory_types: 0,
            host_coherent_memory_types: 0,
            non_coherent_atom_size: 256,
            max_pages: None,
        }
    }
}

#[derive(Debug)]
struct StagingPage {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapping: NonNull<u8>,
    coherent: bool,
    last_submission: u64,
}

/// A pool of persistently mapped upload pages.
#[derive(Debug)]
pub struct StagingPool {
    page_size: DeviceSize,
    host_visible_memory_types: u32,
    host_coherent_memory_types: u32,
    non_coherent_atom_size: DeviceSize,
    max_pages: Option<usize>,
    pages: Vec<StagingPage>,
    // Ordered by `last_submission`, since submissions only ever increase.
    submitted: VecDeque<usize>,
    writable: Vec<usize>,
    current: Option<usize>,
    current_used: DeviceSize,
    current_flushed: DeviceSize,
}

// SAFETY: The mapped pointers are only dereferenced through `&mut self`.
unsafe impl Send for StagingPool {}

impl StagingPool {
    /// # Panics
    ///
    /// - Panics if `create_info.page_size` is zero.
    /// - Panics if `create_info.non_coherent_atom_size` is zero.
    pub fn new(create_info: StagingPoolCreateInfo) -> Self {
        let StagingPoolCreateInfo {
            page_size,
            host_visible_memory_types,
            host_coherent_memory_types,
            non_coherent_atom_size,
            max_pages,
        } = create_info;

        assert_ne!(page_size, 0);
        assert_ne!(non_coherent_atom_size, 0);

        StagingPool {
            page_size,
            host_visible_memory_types,
            host_coherent_memory_types,
            non_coherent_atom_size,
            max_pages,
            pages: Vec::new(),
            submitted: VecDeque::new(),
            writable: Vec::new(),
            current: None,
            current_used: 0,
            current_flushed: 0,
        }
    }

    #[inline]
    pub fn page_size(&self) -> DeviceSize {
        self.page_size
    }

    /// Returns the number of pages created so far.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Returns the number of pages waiting for their submission to complete.
    #[inline]
    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }

    /// Returns the number of pages that are free to be reused.
    #[inline]
    pub fn writable_count(&self) -> usize {
        self.writable.len()
    }

    /// Allocates up to `size` bytes, aligned to `alignment`, for use in `submission`.
    ///
    /// The returned allocation may be smaller than requested: it never exceeds the page size,
    /// and takes whatever space is left in the current page. Callers loop until everything is
    /// covered.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    /// - Panics if `alignment` is not a power of two.
    pub unsafe fn request_partial<D>(
        &mut self,
        device: &D,
        submission: u64,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<StagingAllocation<'_>, StagingError>
    where
        D: DeviceFunctions + ?Sized,
    {
        assert_ne!(size, 0);
        assert!(alignment.is_power_of_two());

        let mut offset = align_up(self.current_used, alignment);

        if self.current.is_none() || offset >= self.page_size {
            unsafe { self.retire_current(device) }?;

            let index = match self.writable.pop() {
                Some(index) => index,
                None => unsafe { self.create_page(device) }?,
            };

            self.current = Some(index);
            self.current_used = 0;
            self.current_flushed = 0;
            offset = 0;
        }

        let Some(index) = self.current else {
            unreachable!();
        };
        let size = size.min(self.page_size - offset);
        let page = &mut self.pages[index];
        page.last_submission = submission;
        self.current_used = offset + size;

        // SAFETY: `offset + size` is within the page, which is mapped for its whole size, and the
        // range isn't handed out again until the submission completes.
        let mapping = unsafe {
            slice::from_raw_parts_mut(page.mapping.as_ptr().add(offset as usize), size as usize)
        };

        Ok(StagingAllocation {
            buffer: page.buffer,
            offset,
            mapping,
        })
    }

    /// Makes every page whose last submission is `completed` or older available for reuse.
    pub fn reclaim(&mut self, completed: u64) {
        while let Some(&index) = self.submitted.front() {
            if self.pages[index].last_submission > completed {
                break;
            }

            self.submitted.pop_front();
            self.writable.push(index);
        }
    }

    /// Flushes host writes to the current page that haven't been flushed yet, so that they are
    /// visible to the device. Does nothing for coherent memory.
    pub unsafe fn flush_writes<D>(&mut self, device: &D) -> Result<(), StagingError>
    where
        D: DeviceFunctions + ?Sized,
    {
        let Some(index) = self.current else {
            return Ok(());
        };

        if !self.pages[index].coherent && self.current_flushed < self.current_used {
            let offset = self.current_flushed / self.non_coherent_atom_size
                * self.non_coherent_atom_size;
            let end = align_up(self.current_used, self.non_coherent_atom_size);
            let size = if end >= self.page_size {
                vk::WHOLE_SIZE
            } else {
                end - offset
            };
            let range = vk::MappedMemoryRange::default()
                .memory(self.pages[index].memory)
                .offset(offset)
                .size(size);

            unsafe { device.flush_mapped_memory_ranges(slice::from_ref(&range)) }
                .map_err(StagingError::VulkanError)?;
        }

        self.current_flushed = self.current_used;

        Ok(())
    }

    unsafe fn retire_current<D>(&mut self, device: &D) -> Result<(), StagingError>
    where
        D: DeviceFunctions + ?Sized,
    {
        unsafe { self.flush_writes(device) }?;

        if let Some(index) = self.current.take() {
            self.submitted.push_back(index);
        }

        Ok(())
    }

    unsafe fn create_page<D>(&mut self, device: &D) -> Result<usize, StagingError>
    where
        D: DeviceFunctions + ?Sized,
    {
        if self.max_pages.is_some_and(|max_pages| self.pages.len() >= max_pages) {
            return Err(StagingError::OutOfPages);
        }

        let create_info = vk::BufferCreateInfo::default()
            .size(self.page_size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer =
            unsafe { device.create_buffer(&create_info) }.map_err(StagingError::VulkanError)?;

        let requirements = unsafe { device.buffer_memory_requirements(buffer) };
        let Some(memory_type_index) = find_memory_type_index(
            requirements.memory_type_bits,
            self.host_visible_memory_types,
            self.host_coherent_memory_types,
        ) else {
            unsafe { device.destroy_buffer(buffer) };

            return Err(StagingError::NoHostVisibleMemoryType);
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&allocate_info) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };

                return Err(StagingError::VulkanError(err));
            }
        };

        let mapping = unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .and_then(|()| unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE) })
            .and_then(|ptr| {
                NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
            });
        let mapping = match mapping {
            Ok(mapping) => mapping,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };
                unsafe { device.free_memory(memory) };

                return Err(StagingError::VulkanError(err));
            }
        };

        self.pages.push(StagingPage {
            buffer,
            memory,
            mapping,
            coherent: self.host_coherent_memory_types & (1 << memory_type_index) != 0,
            last_submission: 0,
        });

        Ok(self.pages.len() - 1)
    }

    /// Destroys every page. The device must no longer be using any of them.
    pub unsafe fn destroy<D>(&mut self, device: &D)
    where
        D: DeviceFunctions + ?Sized,
    {
        for page in self.pages.drain(..) {
            unsafe { device.unmap_memory(page.memory) };
            unsafe { device.destroy_buffer(page.buffer) };
            unsafe { device.free_memory(page.memory) };
        }

        self.submitted.clear();
        self.writable.clear();
        self.current = None;
        self.current_used = 0;
        self.current_flushed = 0;
    }
}

/// A mapped range of a staging page.
#[derive(Debug)]
pub struct StagingAllocation<'a> {
    /// The page's buffer, to be used as the source of a copy.
    pub buffer: vk::Buffer,
    /// The offset of the allocation within `buffer`.
    pub offset: DeviceSize,
    /// The host mapping of the allocation. Its length is the size of the allocation.
    pub mapping: &'a mut [u8],
}

impl StagingAllocation<'_> {
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.mapping.len() as DeviceSize
    }
}

/// Error that can happen when requesting staging memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingError {
    /// The pool reached its page limit and no page is free.
    OutOfPages,
    /// None of the memory types a staging buffer can be bound to is host-visible.
    NoHostVisibleMemoryType,
    VulkanError(vk::Result),
}

impl fmt::Display for StagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfPages => "the staging pool has no free pages left",
            Self::NoHostVisibleMemoryType => {
                "no host-visible memory type is compatible with a staging buffer"
            }
            Self::VulkanError(_) => "a runtime error occurred",
        };

        f.write_str(msg)
    }
}

impl Error for StagingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::VulkanError(err) => Some(err),
            _ => None,
        }
    }
}
