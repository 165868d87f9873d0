use errno::errno;
use libc::{
    c_int, c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_PRIVATE, PROT_READ,
    PROT_WRITE,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// The frame pool: one mapped memory area, shared with the kernel as the umem, that backs every
/// packet buffer.
#[derive(Debug)]
pub struct MmapArea {
    pub(crate) frame_count: usize,
    pub(crate) frame_size: usize,
    ptr: *mut c_void,
}
// The area is only a pointer plus its size; access to individual frames is coordinated through
// the FrameArena which is owned by a single thread.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("mmap of frame pool ({0} bytes) failed, errno {1}")]
    Failed(usize, i32),
    #[error("frame pool size {0} x {1} overflows")]
    TooLarge(usize, usize),
}

/// Configuration options for MmapArea
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAreaOptions {
    /// If set to true, the mmap call is passed MAP_HUGETLB
    pub huge_tlb: bool,
}

impl MmapArea {
    /// Map `frame_count * frame_size` bytes of anonymous memory.
    ///
    /// # Arguments
    ///
    /// * frame_count: The number of frames in the pool
    /// * frame_size: The length of each frame
    /// * options: Configuration options
    pub fn new(
        frame_count: usize,
        frame_size: usize,
        options: MmapAreaOptions,
    ) -> Result<Arc<MmapArea>, MmapError> {
        let len = frame_count
            .checked_mul(frame_size)
            .ok_or(MmapError::TooLarge(frame_count, frame_size))?;

        let mut flags: c_int = MAP_PRIVATE | MAP_ANONYMOUS;
        if options.huge_tlb {
            flags |= MAP_HUGETLB;
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                flags,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED || ptr.is_null() {
            return Err(MmapError::Failed(len, errno().0));
        }

        Ok(Arc::new(MmapArea {
            frame_count,
            frame_size,
            ptr,
        }))
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn len(&self) -> usize {
        self.frame_count * self.frame_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    /// Bytes `addr..addr + len` of the pool, or `None` if the range leaves the frame that
    /// `addr` points into.
    ///
    /// # Safety
    ///
    /// The caller must own the frame (it came off the rx or completion ring, or out of the
    /// FrameArena, and has not been handed back) and must not hold another slice into it.
    #[inline]
    pub unsafe fn frame_mut(&self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let addr = addr as usize;
        let frame_end = (addr / self.frame_size + 1) * self.frame_size;
        if addr >= self.len() || addr + len > frame_end {
            return None;
        }
        let ptr = (self.ptr as *mut u8).add(addr);
        Some(std::slice::from_raw_parts_mut(ptr, len))
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let r = unsafe { munmap(self.ptr, self.len()) };

        if r != 0 {
            warn!(errno = errno().0, "munmap of frame pool failed");
        }
    }
}
