//! Tracking of how the device last accessed the shared memory buffer, and the barriers needed to
//! move from one kind of access to the next.

use crate::DeviceSize;
use ash::vk;
use std::ops::Range;

/// The way the device is about to access the shared memory buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessMode {
    /// Index fetch, shader reads, and transfer reads from the buffer.
    Read,
    /// Writes from compute shaders, such as resolves and memory exports done by compute.
    ComputeWrite,
    /// Guest draws that may both read and write the buffer through shader storage access.
    GuestDrawReadWrite,
    /// Uploads of guest memory into the buffer.
    TransferDestination,
}

impl AccessMode {
    /// Returns whether the device may write the buffer in this mode.
    #[inline]
    pub const fn is_write(self) -> bool {
        !matches!(self, AccessMode::Read)
    }

    /// Returns the synchronization scope covering accesses in this mode.
    ///
    /// `tessellation_shader` adds the tessellation evaluation stage to the graphics stages,
    /// and must only be set if the feature is enabled on the device.
    #[inline]
    pub fn sync_scope(self, tessellation_shader: bool) -> SyncScope {
        let mut scope = SYNC_SCOPES[self as usize];

        if tessellation_shader && scope.stages.contains(GRAPHICS_STAGES) {
            scope.stages |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
        }

        scope
    }
}

/// Pipeline stages and memory accesses on one side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncScope {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

const GRAPHICS_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_INPUT.as_raw()
        | vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw(),
);

/// Indexed by `AccessMode as usize`.
const SYNC_SCOPES: [SyncScope; 4] = [
    // Read
    SyncScope {
        stages: vk::PipelineStageFlags::from_raw(
            GRAPHICS_STAGES.as_raw()
                | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw()
                | vk::PipelineStageFlags::TRANSFER.as_raw(),
        ),
        access: vk::AccessFlags::from_raw(
            vk::AccessFlags::INDEX_READ.as_raw()
                | vk::AccessFlags::SHADER_READ.as_raw()
                | vk::AccessFlags::TRANSFER_READ.as_raw(),
        ),
    },
    // ComputeWrite
    SyncScope {
        stages: vk::PipelineStageFlags::COMPUTE_SHADER,
        access: vk::AccessFlags::SHADER_READ,
    },
    // GuestDrawReadWrite
    SyncScope {
        stages: GRAPHICS_STAGES,
        access: vk::AccessFlags::from_raw(
            vk::AccessFlags::INDEX_READ.as_raw()
                | vk::AccessFlags::SHADER_READ.as_raw()
                | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
    },
    // TransferDestination
    SyncScope {
        stages: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_WRITE,
    },
];

/// A barrier that has to be recorded before the newly declared access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessTransition {
    pub src_mode: AccessMode,
    pub dst_mode: AccessMode,
    /// The byte range the barrier covers, with `vk::WHOLE_SIZE` as the end when the whole buffer
    /// is covered.
    pub range: Range<DeviceSize>,
}

impl AccessTransition {
    #[inline]
    pub fn is_whole_buffer(&self) -> bool {
        self.range.start == 0 && self.range.end == vk::WHOLE_SIZE
    }
}

/// The last declared access to a buffer of `size` bytes, and what it wrote.
#[derive(Clone, Debug)]
pub struct AccessState {
    size: DeviceSize,
    current: AccessMode,
    pending_write: Range<DeviceSize>,
}

impl AccessState {
    /// Everything starts out as a transfer destination, since the first thing that happens to
    /// the buffer is an upload.
    #[inline]
    pub fn new(size: DeviceSize) -> Self {
        AccessState {
            size,
            current: AccessMode::TransferDestination,
            pending_write: 0..0,
        }
    }

    #[inline]
    pub fn current(&self) -> AccessMode {
        self.current
    }

    /// The range written since the last declaration, empty if nothing was.
    #[inline]
    pub fn pending_write(&self) -> Range<DeviceSize> {
        self.pending_write.clone()
    }

    /// Declares that the device is about to access the buffer in `mode`, writing
    /// `written_range`. Returns the barrier that must be recorded before that access, if any.
    ///
    /// # Panics
    ///
    /// - Panics if `mode` is [`AccessMode::Read`] and `written_range` is not empty after clamping.
    pub fn declare(
        &mut self,
        mode: AccessMode,
        written_range: Range<DeviceSize>,
    ) -> Option<AccessTransition> {
        let start = written_range.start.min(self.size);
        let end = written_range.end.clamp(start, self.size);
        assert!(
            mode.is_write() || start == end,
            "a read access of the shared memory can't write {start}..{end}",
        );

        let transition = if mode != self.current || !self.pending_write.is_empty() {
            let src_mode = self.current;

            let range = if mode == self.current {
                // Committing the previous write.
                self.pending_write.clone()
            } else {
                // The stages and accesses change, so all preceding writes have to be made
                // available to the new destination stages as well.
                self.current = mode;
                0..vk::WHOLE_SIZE
            };

            Some(AccessTransition {
                src_mode,
                dst_mode: mode,
                range,
            })
        } else {
            None
        };

        self.pending_write = start..end;

        transition
    }

    /// Goes back to the initial state.
    #[inline]
    pub fn reset(&mut self) {
        self.current = AccessMode::TransferDestination;
        self.pending_write = 0..0;
    }
}
