#![cfg(test)]

//! Fakes standing in for the device and the collaborators of the shared memory.

use crate::{
    command_buffer::{DeferredCommand, DeferredCommandBuffer},
    device::{DeviceFunctions, MemoryTypes},
    DeviceSize, SharedMemoryCreateInfo, TraceWriter, ValidityTracker,
};
use ash::{prelude::VkResult, vk, vk::Handle};
use std::{cell::RefCell, collections::HashMap, ffi::c_void, ptr::NonNull};

pub(crate) const DEVICE_LOCAL: u32 = 0b001;
pub(crate) const HOST_VISIBLE: u32 = 0b110;
pub(crate) const HOST_COHERENT: u32 = 0b010;

const MEMORY_ALIGNMENT: DeviceSize = 64 << 10;

/// Settings used by most tests: 4 KiB guest pages and 8 KiB staging pages.
pub(crate) fn create_info() -> SharedMemoryCreateInfo {
    SharedMemoryCreateInfo {
        page_size_log2: 12,
        memory_types: MemoryTypes {
            device_local: DEVICE_LOCAL,
            host_visible: HOST_VISIBLE,
            host_coherent: HOST_COHERENT,
        },
        staging_page_size: 8192,
        non_coherent_atom_size: 64,
        ..Default::default()
    }
}

/// Guest memory where no two neighboring pages look alike.
pub(crate) fn guest_pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_right(i as u32 >> 12) as u8)
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct RecordingValidity {
    pub(crate) marks: Vec<(u32, u32, bool)>,
}

impl ValidityTracker for RecordingValidity {
    fn mark_range_valid(&mut self, start: u32, length: u32, post_copy: bool) {
        self.marks.push((start, length, post_copy));
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingTraceWriter {
    pub(crate) reads: Vec<(u32, u32)>,
}

impl TraceWriter for RecordingTraceWriter {
    fn write_memory_read(&mut self, address: u32, length: u32) {
        self.reads.push((address, length));
    }
}

struct FakeBuffer {
    size: DeviceSize,
    flags: vk::BufferCreateFlags,
    bound_memory: Option<vk::DeviceMemory>,
    sparse_bound_size: DeviceSize,
    // Contents of buffers that aren't bound to host memory.
    contents: Vec<u8>,
}

struct FakeMemory {
    host_data: Option<NonNull<[u8]>>,
    mapped: bool,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    buffers: HashMap<vk::Buffer, FakeBuffer>,
    memory: HashMap<vk::DeviceMemory, FakeMemory>,
    flushed_ranges: Vec<(DeviceSize, DeviceSize)>,
    reject_sparse_buffers: bool,
    fail_sparse_binds: bool,
    fail_device_allocations: bool,
    fail_host_allocations: bool,
}

impl FakeState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn host_data(&self, buffer: vk::Buffer) -> Option<NonNull<[u8]>> {
        let memory = self.buffers[&buffer].bound_memory?;

        self.memory[&memory].host_data
    }
}

impl Drop for FakeState {
    fn drop(&mut self) {
        for memory in self.memory.values() {
            if let Some(data) = memory.host_data {
                drop(unsafe { Box::from_raw(data.as_ptr()) });
            }
        }
    }
}

/// A device whose memory lives on the host.
///
/// Device-local buffer contents are kept per buffer and grow as they are written, so the
/// shared memory buffer doesn't take up its full size.
#[derive(Default)]
pub(crate) struct FakeDevice {
    state: RefCell<FakeState>,
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        FakeDevice::default()
    }

    pub(crate) fn reject_sparse_buffers(&self) {
        self.state.borrow_mut().reject_sparse_buffers = true;
    }

    pub(crate) fn fail_sparse_binds(&self) {
        self.state.borrow_mut().fail_sparse_binds = true;
    }

    pub(crate) fn fail_device_allocations(&self) {
        self.state.borrow_mut().fail_device_allocations = true;
    }

    pub(crate) fn fail_host_allocations(&self) {
        self.state.borrow_mut().fail_host_allocations = true;
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.state.borrow().memory.len()
    }

    pub(crate) fn mapped_allocations(&self) -> usize {
        self.state
            .borrow()
            .memory
            .values()
            .filter(|memory| memory.mapped)
            .count()
    }

    pub(crate) fn buffer_size(&self, buffer: vk::Buffer) -> DeviceSize {
        self.state.borrow().buffers[&buffer].size
    }

    pub(crate) fn buffer_flags(&self, buffer: vk::Buffer) -> vk::BufferCreateFlags {
        self.state.borrow().buffers[&buffer].flags
    }

    pub(crate) fn sparse_bound_size(&self, buffer: vk::Buffer) -> DeviceSize {
        self.state.borrow().buffers[&buffer].sparse_bound_size
    }

    /// Returns the `(offset, size)` of every flushed range, in order.
    pub(crate) fn flushed_ranges(&self) -> Vec<(DeviceSize, DeviceSize)> {
        self.state.borrow().flushed_ranges.clone()
    }

    pub(crate) fn read_buffer(
        &self,
        buffer: vk::Buffer,
        offset: DeviceSize,
        len: usize,
    ) -> Vec<u8> {
        let state = self.state.borrow();
        let offset = offset as usize;

        if let Some(data) = state.host_data(buffer) {
            let data = unsafe { data.as_ref() };

            data[offset..offset + len].to_vec()
        } else {
            let contents = &state.buffers[&buffer].contents;

            (offset..offset + len)
                .map(|i| contents.get(i).copied().unwrap_or(0))
                .collect()
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: DeviceSize, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        let offset = offset as usize;

        if let Some(mut data) = state.host_data(buffer) {
            let data = unsafe { data.as_mut() };
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        } else {
            let contents = &mut state.buffers.get_mut(&buffer).unwrap().contents;

            if contents.len() < offset + bytes.len() {
                contents.resize(offset + bytes.len(), 0);
            }

            contents[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Executes the copies in `cbf` as the device would.
    pub(crate) fn replay(&self, cbf: &DeferredCommandBuffer) {
        for command in cbf.commands() {
            if let DeferredCommand::CopyBuffer {
                src_buffer,
                dst_buffer,
                regions,
            } = command
            {
                for region in regions {
                    let bytes =
                        self.read_buffer(*src_buffer, region.src_offset, region.size as usize);
                    self.write_buffer(*dst_buffer, region.dst_offset, &bytes);
                }
            }
        }
    }
}

impl DeviceFunctions for FakeDevice {
    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.borrow_mut();

        if state.reject_sparse_buffers
            && create_info
                .flags
                .contains(vk::BufferCreateFlags::SPARSE_BINDING)
        {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        let buffer = vk::Buffer::from_raw(state.next_handle());
        state.buffers.insert(
            buffer,
            FakeBuffer {
                size: create_info.size,
                flags: create_info.flags,
                bound_memory: None,
                sparse_bound_size: 0,
                contents: Vec::new(),
            },
        );

        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let removed = self.state.borrow_mut().buffers.remove(&buffer);
        assert!(removed.is_some(), "destroying an unknown buffer");
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.borrow().buffers[&buffer].size;

        vk::MemoryRequirements {
            size: size.div_ceil(MEMORY_ALIGNMENT) * MEMORY_ALIGNMENT,
            alignment: MEMORY_ALIGNMENT,
            memory_type_bits: DEVICE_LOCAL | HOST_VISIBLE,
        }
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.borrow_mut();
        let type_bit = 1 << allocate_info.memory_type_index;
        let host_visible = HOST_VISIBLE & type_bit != 0;

        if host_visible && state.fail_host_allocations {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        if DEVICE_LOCAL & type_bit != 0 && state.fail_device_allocations {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        let host_data = host_visible.then(|| {
            let data = vec![0u8; allocate_info.allocation_size as usize].into_boxed_slice();

            NonNull::from(Box::leak(data))
        });
        let memory = vk::DeviceMemory::from_raw(state.next_handle());
        state.memory.insert(
            memory,
            FakeMemory {
                host_data,
                mapped: false,
            },
        );

        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.state.borrow_mut().memory.remove(&memory);
        let removed = removed.expect("freeing unknown memory");

        if let Some(data) = removed.host_data {
            drop(unsafe { Box::from_raw(data.as_ptr()) });
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        assert_eq!(offset, 0);

        let mut state = self.state.borrow_mut();
        assert!(state.memory.contains_key(&memory));
        state.buffers.get_mut(&buffer).unwrap().bound_memory = Some(memory);

        Ok(())
    }

    unsafe fn bind_sparse_buffer_memory(
        &self,
        buffer: vk::Buffer,
        binds: &[vk::SparseMemoryBind],
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();

        if state.fail_sparse_binds {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }

        let bound_size = binds.iter().map(|bind| bind.size).sum::<DeviceSize>();
        let buffer = state.buffers.get_mut(&buffer).unwrap();
        assert!(buffer.flags.contains(vk::BufferCreateFlags::SPARSE_BINDING));
        buffer.sparse_bound_size += bound_size;

        Ok(())
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        assert_eq!(offset, 0);
        assert_eq!(size, vk::WHOLE_SIZE);

        let mut state = self.state.borrow_mut();
        let memory = state.memory.get_mut(&memory).unwrap();
        let data = memory.host_data.ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        memory.mapped = true;

        Ok(data.as_ptr().cast::<c_void>())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        let memory = state.memory.get_mut(&memory).unwrap();
        assert!(memory.mapped);
        memory.mapped = false;
    }

    unsafe fn flush_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();

        for range in ranges {
            assert!(state.memory[&range.memory].mapped);
            state.flushed_ranges.push((range.offset, range.size));
        }

        Ok(())
    }
}

#[test]
fn fake_device_round_trip() {
    let device = FakeDevice::new();
    let create_info = vk::BufferCreateInfo::default().size(4096);

    unsafe {
        let buffer = device.create_buffer(&create_info).unwrap();
        device.write_buffer(buffer, 100, b"xyz");
        assert_eq!(device.read_buffer(buffer, 99, 5), b"\0xyz\0");
        device.destroy_buffer(buffer);
    }

    assert_eq!(device.live_buffers(), 0);
    assert_ne!(guest_pattern(8192)[..4096], guest_pattern(8192)[4096..]);
}
