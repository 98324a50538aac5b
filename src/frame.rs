use core::marker::PhantomData;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::{HostPhysAddr, Result, VmmHal, VmxError};

/// A 4K-sized physical frame, deallocated automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: VmmHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> PhysFrame<H> {
    /// Allocate a [`PhysFrame`] filled with zeros.
    pub fn alloc_zero() -> Result<Self> {
        let start_paddr = H::alloc_frame().ok_or(VmxError::OutOfMemory)?;
        assert_ne!(start_paddr.as_usize(), 0);
        let frame = Self {
            start_paddr,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
        Ok(frame)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }
}

impl<H: VmmHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("[VMM] deallocated PhysFrame({:#x})", self.start_paddr.as_usize());
    }
}

/// Physically contiguous frames large enough for `size` bytes, optionally
/// placed on a NUMA node. Deallocated automatically on drop.
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: VmmHal> {
    start_paddr: HostPhysAddr,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> ContiguousPhysFrames<H> {
    /// Allocate zero-filled frames covering at least `size` bytes (at least
    /// one frame) on `node` if possible.
    pub fn alloc_zero(size: usize, node: Option<usize>) -> Result<Self> {
        let frame_count = size.div_ceil(PAGE_SIZE).max(1);
        let start_paddr = H::alloc_contiguous_frames(frame_count, node)
            .ok_or(VmxError::OutOfMemory)?;
        assert_ne!(start_paddr.as_usize(), 0);
        let frames = Self {
            start_paddr,
            frame_count,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frames.as_mut_ptr(), 0, frames.size()) };
        Ok(frames)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }
}

impl<H: VmmHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        H::dealloc_contiguous_frames(self.start_paddr, self.frame_count);
        debug!(
            "[VMM] deallocated ContiguousPhysFrames({:#x}, {} frames)",
            self.start_paddr.as_usize(),
            self.frame_count
        );
    }
}
