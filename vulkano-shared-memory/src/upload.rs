use crate::{
    command_buffer::{BufferCopy, CommandSink},
    device::DeviceFunctions,
    staging::{StagingError, StagingPool},
    AccessMode, DeviceSize, GuestMemory, SharedMemory, SubmissionCounters, TraceWriter,
    ValidityTracker,
};
use ash::vk;
use smallvec::SmallVec;
use std::{error::Error, fmt};

/// A range of guest pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageRange {
    /// The index of the first page.
    pub start: u32,
    /// The number of pages.
    pub count: u32,
}

impl PageRange {
    #[inline]
    pub const fn new(start: u32, count: u32) -> Self {
        PageRange { start, count }
    }

    #[inline]
    pub const fn end(self) -> u32 {
        self.start + self.count
    }
}

/// The collaborators of an upload.
pub struct UploadContext<'a> {
    /// Receives the barrier and copy commands.
    pub commands: &'a mut dyn CommandSink,
    /// The source of the uploaded bytes.
    pub guest_memory: &'a dyn GuestMemory,
    /// Informed of every range before it is copied.
    pub validity: &'a mut dyn ValidityTracker,
    pub trace_writer: &'a mut dyn TraceWriter,
    /// The staging memory is tagged with `submissions.current`.
    pub submissions: SubmissionCounters,
}

/// Copy regions sharing the same source buffer, which can go into a single copy command.
struct CopyBatch {
    src_buffer: vk::Buffer,
    regions: SmallVec<[BufferCopy; 16]>,
}

impl CopyBatch {
    fn new() -> Self {
        CopyBatch {
            src_buffer: vk::Buffer::null(),
            regions: SmallVec::new(),
        }
    }

    fn push(
        &mut self,
        commands: &mut dyn CommandSink,
        dst_buffer: vk::Buffer,
        src_buffer: vk::Buffer,
        region: BufferCopy,
    ) {
        if src_buffer != self.src_buffer {
            self.flush(commands, dst_buffer);
            self.src_buffer = src_buffer;
        }

        self.regions.push(region);
    }

    fn flush(&mut self, commands: &mut dyn CommandSink, dst_buffer: vk::Buffer) {
        if self.regions.is_empty() {
            return;
        }

        debug_assert_ne!(self.src_buffer, vk::Buffer::null());
        commands.copy_buffer(self.src_buffer, dst_buffer, &self.regions);
        self.regions.clear();
    }
}

impl<D> SharedMemory<D>
where
    D: DeviceFunctions + ?Sized,
{
    /// Copies the guest pages in `ranges` into the buffer.
    ///
    /// `ranges` must be sorted and must not overlap. Every range is marked valid in
    /// `cx.validity` as it is staged, and the copies are recorded into `cx.commands` after a
    /// transfer destination access covering all of them has been declared.
    ///
    /// If staging memory runs out, the remaining ranges are skipped and an error is returned.
    /// Copies recorded up to that point are kept, and cover exactly what was marked valid.
    ///
    /// # Panics
    ///
    /// - Panics if the shared memory has been shut down.
    pub fn upload_ranges(
        &mut self,
        cx: &mut UploadContext<'_>,
        ranges: &[PageRange],
    ) -> Result<(), UploadError> {
        let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
            return Ok(());
        };

        debug_assert!(ranges
            .windows(2)
            .all(|pair| pair[0].end() <= pair[1].start));

        let page_size_log2 = self.page_size_log2;
        let start = DeviceSize::from(first.start) << page_size_log2;
        let end = DeviceSize::from(last.end()) << page_size_log2;
        self.declare_access(cx.commands, AccessMode::TransferDestination, start..end);

        let dst_buffer = self.buffer();
        let device = &*self.device;
        let staging_pool = self
            .staging_pool
            .as_mut()
            .unwrap_or_else(|| panic!("the shared memory has been shut down"));

        let mut batch = CopyBatch::new();
        let result = ranges.iter().try_for_each(|&range| {
            upload_range(
                device,
                staging_pool,
                cx,
                &mut batch,
                dst_buffer,
                range,
                page_size_log2,
            )
        });
        batch.flush(cx.commands, dst_buffer);

        result.inspect_err(|err| {
            tracing::error!("Shared memory: Failed to get a Vulkan upload buffer: {}", err);
        })
    }
}

fn upload_range<D>(
    device: &D,
    staging_pool: &mut StagingPool,
    cx: &mut UploadContext<'_>,
    batch: &mut CopyBatch,
    dst_buffer: vk::Buffer,
    range: PageRange,
    page_size_log2: u32,
) -> Result<(), UploadError>
where
    D: DeviceFunctions + ?Sized,
{
    cx.trace_writer
        .write_memory_read(range.start << page_size_log2, range.count << page_size_log2);

    let mut start = range.start;
    let mut remaining = range.count;

    while remaining != 0 {
        // SAFETY: Staging pages are only reclaimed once `submissions.current` has completed.
        let allocation = unsafe {
            staging_pool.request_partial(
                device,
                cx.submissions.current,
                DeviceSize::from(remaining) << page_size_log2,
                1 << page_size_log2,
            )
        }?;

        let address = start << page_size_log2;
        let size = allocation.size();

        // Claim the range before copying, so that a validity check in between can't miss it.
        cx.validity.mark_range_valid(address, size as u32, false);
        allocation
            .mapping
            .copy_from_slice(cx.guest_memory.translate_physical(address, size as usize));

        batch.push(
            cx.commands,
            dst_buffer,
            allocation.buffer,
            BufferCopy {
                src_offset: allocation.offset,
                dst_offset: DeviceSize::from(address),
                size,
            },
        );

        let pages = (size >> page_size_log2) as u32;
        debug_assert_ne!(pages, 0);
        start += pages;
        remaining -= pages;
    }

    Ok(())
}

/// Error that can happen when uploading guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadError {
    StagingAllocation(StagingError),
}

impl From<StagingError> for UploadError {
    fn from(err: StagingError) -> Self {
        Self::StagingAllocation(err)
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StagingAllocation(_) => f.write_str("failed to allocate staging memory"),
        }
    }
}

impl Error for UploadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StagingAllocation(err) => Some(err),
        }
    }
}
