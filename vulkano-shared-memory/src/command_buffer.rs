//! Recording of the commands the shared memory issues.

use crate::DeviceSize;
use ash::vk;
use smallvec::SmallVec;
use std::slice;

/// Receives the barrier and copy commands of the shared memory, in submission order.
pub trait CommandSink {
    fn pipeline_barrier(&mut self, barrier: &BufferMemoryBarrier);

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[BufferCopy],
    );
}

/// A memory dependency on a range of a single buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferMemoryBarrier {
    pub src_stages: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub buffer: vk::Buffer,
    pub offset: DeviceSize,
    /// May be `vk::WHOLE_SIZE`.
    pub size: DeviceSize,
}

impl BufferMemoryBarrier {
    pub(crate) fn to_vk(&self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// A region to copy from one buffer to another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: DeviceSize,
    pub dst_offset: DeviceSize,
    pub size: DeviceSize,
}

impl BufferCopy {
    #[inline]
    pub(crate) fn to_vk(self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: self.src_offset,
            dst_offset: self.dst_offset,
            size: self.size,
        }
    }
}

/// A command held by a [`DeferredCommandBuffer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredCommand {
    PipelineBarrier(BufferMemoryBarrier),
    CopyBuffer {
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: SmallVec<[BufferCopy; 4]>,
    },
}

/// Commands stored on the host, to be replayed into a Vulkan command buffer once it is known
/// which command buffer the work ends up in.
#[derive(Debug, Default)]
pub struct DeferredCommandBuffer {
    commands: Vec<DeferredCommand>,
}

impl DeferredCommandBuffer {
    #[inline]
    pub fn new() -> Self {
        DeferredCommandBuffer::default()
    }

    #[inline]
    pub fn commands(&self) -> &[DeferredCommand] {
        &self.commands
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    /// Records every stored command into `command_buffer`.
    ///
    /// # Safety
    ///
    /// - `command_buffer` must be in the recording state, outside of a render pass, and must
    ///   have been allocated from `device`.
    /// - Every buffer referenced by the commands must still be alive.
    pub unsafe fn execute(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        for command in &self.commands {
            match command {
                DeferredCommand::PipelineBarrier(barrier) => {
                    let barrier_vk = barrier.to_vk();

                    unsafe {
                        device.cmd_pipeline_barrier(
                            command_buffer,
                            barrier.src_stages,
                            barrier.dst_stages,
                            vk::DependencyFlags::empty(),
                            &[],
                            slice::from_ref(&barrier_vk),
                            &[],
                        )
                    };
                }
                DeferredCommand::CopyBuffer {
                    src_buffer,
                    dst_buffer,
                    regions,
                } => {
                    let regions_vk: SmallVec<[_; 4]> =
                        regions.iter().map(|region| region.to_vk()).collect();

                    unsafe {
                        device.cmd_copy_buffer(
                            command_buffer,
                            *src_buffer,
                            *dst_buffer,
                            &regions_vk,
                        )
                    };
                }
            }
        }
    }
}

impl CommandSink for DeferredCommandBuffer {
    fn pipeline_barrier(&mut self, barrier: &BufferMemoryBarrier) {
        self.commands.push(DeferredCommand::PipelineBarrier(barrier.clone()));
    }

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[BufferCopy],
    ) {
        if regions.is_empty() {
            return;
        }

        self.commands.push(DeferredCommand::CopyBuffer {
            src_buffer,
            dst_buffer,
            regions: regions.iter().copied().collect(),
        });
    }
}
