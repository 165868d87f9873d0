use std::fmt;

use thiserror::Error;

/// Index of a frame inside the frame pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameHandle(u32);

impl FrameHandle {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{0} released while already free")]
    DoubleRelease(FrameHandle),
    #[error("umem address {0:#x} is outside the frame pool")]
    OutOfRange(u64),
}

/// Tracks ownership of the frames in the pool.
///
/// Free handles are kept on a LIFO stack so the most recently used (and most likely cached)
/// frame is handed out first. A bitmap mirrors the stack so releasing an already free handle is
/// reported instead of silently duplicating it.
#[derive(Debug)]
pub struct FrameArena {
    frame_size: u32,
    capacity: u32,
    free: Vec<FrameHandle>,
    free_map: Vec<u64>,
}

impl FrameArena {
    /// All `capacity` frames start out free.
    pub fn new(capacity: u32, frame_size: u32) -> FrameArena {
        let words = (capacity as usize + 63) / 64;
        let mut free_map = vec![u64::MAX; words];
        let tail = capacity % 64;
        if tail != 0 {
            if let Some(last) = free_map.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }

        // Reverse order so handle 0 is allocated first.
        let free = (0..capacity).rev().map(FrameHandle).collect();

        FrameArena {
            frame_size,
            capacity,
            free,
            free_map,
        }
    }

    #[inline]
    pub fn allocate(&mut self) -> Option<FrameHandle> {
        let handle = self.free.pop()?;
        self.clear_free(handle);
        Some(handle)
    }

    #[inline]
    pub fn release(&mut self, handle: FrameHandle) -> Result<(), FrameError> {
        if handle.0 >= self.capacity {
            return Err(FrameError::OutOfRange(self.addr(handle)));
        }
        if self.is_free(handle) {
            return Err(FrameError::DoubleRelease(handle));
        }
        self.set_free(handle);
        self.free.push(handle);
        Ok(())
    }

    /// Release the frame containing a umem address handed back by the kernel.
    #[inline]
    pub fn release_addr(&mut self, addr: u64) -> Result<(), FrameError> {
        let handle = self.handle_for_addr(addr)?;
        self.release(handle)
    }

    /// Offset of the frame's first byte in the pool.
    #[inline]
    pub fn addr(&self, handle: FrameHandle) -> u64 {
        handle.0 as u64 * self.frame_size as u64
    }

    /// The kernel may return an address pointing past the start of a frame (headroom), so the
    /// address is rounded down to its frame.
    #[inline]
    pub fn handle_for_addr(&self, addr: u64) -> Result<FrameHandle, FrameError> {
        let idx = addr / self.frame_size as u64;
        if idx >= self.capacity as u64 {
            return Err(FrameError::OutOfRange(addr));
        }
        Ok(FrameHandle(idx as u32))
    }

    pub fn is_free(&self, handle: FrameHandle) -> bool {
        let (word, bit) = Self::slot(handle);
        self.free_map
            .get(word)
            .map_or(false, |w| w & (1 << bit) != 0)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    #[inline]
    fn slot(handle: FrameHandle) -> (usize, u32) {
        ((handle.0 / 64) as usize, handle.0 % 64)
    }

    #[inline]
    fn set_free(&mut self, handle: FrameHandle) {
        let (word, bit) = Self::slot(handle);
        self.free_map[word] |= 1 << bit;
    }

    #[inline]
    fn clear_free(&mut self, handle: FrameHandle) {
        let (word, bit) = Self::slot(handle);
        self.free_map[word] &= !(1 << bit);
    }
}
