use std::cmp::min;
use std::ptr;
use std::sync::Arc;

use libbpf_sys::{
    _xsk_ring_cons__comp_addr, _xsk_ring_cons__peek, _xsk_ring_cons__release,
    _xsk_ring_prod__fill_addr, _xsk_ring_prod__needs_wakeup, _xsk_ring_prod__reserve,
    _xsk_ring_prod__submit, xsk_ring_cons, xsk_ring_prod, xsk_umem, xsk_umem__create,
    xsk_umem__delete, xsk_umem_config, XSK_UMEM__DEFAULT_FRAME_HEADROOM,
};
use thiserror::Error;

use crate::mmap_area::MmapArea;

/// AF_XDP Umem
#[derive(Debug)]
pub struct Umem {
    _area: Arc<MmapArea>,
    pub(crate) umem: *mut xsk_umem,
}
// The umem handle is only touched at socket creation and on drop.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

/// Completion queue per Umem
#[derive(Debug)]
pub struct UmemCompletionQueue {
    _umem: Arc<Umem>,
    cq: Box<xsk_ring_cons>,
}
unsafe impl Send for UmemCompletionQueue {}

/// Fill queue per Umem
#[derive(Debug)]
pub struct UmemFillQueue {
    _umem: Arc<Umem>,
    fq: Box<xsk_ring_prod>,
}
unsafe impl Send for UmemFillQueue {}

#[derive(Debug, Error)]
pub enum UmemError {
    #[error("umem create failed: {0}")]
    Create(i32),
}

impl Umem {
    /// Create a new Umem using the passed memory mapped area
    pub fn new(
        area: Arc<MmapArea>,
        completion_ring_size: u32,
        fill_ring_size: u32,
    ) -> Result<(Arc<Umem>, UmemCompletionQueue, UmemFillQueue), UmemError> {
        let cfg = xsk_umem_config {
            fill_size: fill_ring_size,
            comp_size: completion_ring_size,
            frame_size: area.frame_size() as u32,
            frame_headroom: XSK_UMEM__DEFAULT_FRAME_HEADROOM,
            flags: 0,
        };

        // Allocate the rings on the heap since we pass these pointers to xsk_umem_create()
        let mut cq: Box<xsk_ring_cons> = Default::default();
        let mut fq: Box<xsk_ring_prod> = Default::default();

        let mut umem: *mut xsk_umem = ptr::null_mut();

        let ret = unsafe {
            xsk_umem__create(
                &mut umem,
                area.as_ptr(),
                area.len() as u64,
                fq.as_mut(),
                cq.as_mut(),
                &cfg,
            )
        };

        if ret != 0 || umem.is_null() {
            return Err(UmemError::Create(ret));
        }

        let arc = Arc::new(Umem { _area: area, umem });

        let cq = UmemCompletionQueue {
            _umem: arc.clone(),
            cq,
        };
        let fq = UmemFillQueue {
            _umem: arc.clone(),
            fq,
        };

        Ok((arc, cq, fq))
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        unsafe {
            xsk_umem__delete(self.umem);
        }
    }
}

impl UmemCompletionQueue {
    /// After packets have been transmitted, their frames are returned via the completion queue.
    /// Appends up to `batch_size` completed umem addresses to `addrs`.
    #[inline]
    pub fn service(&mut self, addrs: &mut Vec<u64>, batch_size: usize) -> usize {
        let mut idx: u32 = 0;

        let ready =
            unsafe { _xsk_ring_cons__peek(self.cq.as_mut(), batch_size as u64, &mut idx) as usize };
        if ready == 0 {
            return 0;
        }

        for _ in 0..ready {
            unsafe {
                addrs.push(*_xsk_ring_cons__comp_addr(self.cq.as_mut(), idx));
            }
            idx = idx.wrapping_add(1);
        }

        unsafe {
            _xsk_ring_cons__release(self.cq.as_mut(), ready as u64);
        }

        ready
    }
}

impl UmemFillQueue {
    /// Number of free fill slots, bounded by `wanted`.
    ///
    /// Only re-reads the kernel's consumer index when the cached view is not enough to satisfy
    /// `wanted` (same scheme as libbpf's xsk_prod_nb_free).
    #[inline]
    pub fn nb_free(&mut self, wanted: u32) -> u32 {
        let fq = self.fq.as_mut();
        let free = fq.cached_cons.wrapping_sub(fq.cached_prod);
        if free >= wanted {
            return wanted;
        }

        let consumer = unsafe { ptr::read_volatile(fq.consumer) };
        fq.cached_cons = consumer.wrapping_add(fq.size);
        min(fq.cached_cons.wrapping_sub(fq.cached_prod), wanted)
    }

    /// In order to receive packets, the link needs frames to write the packets to. These frames
    /// are sent from userspace to the kernel via the fill queue. The reservation is all or
    /// nothing: either every address in `addrs` is submitted or none is.
    #[inline]
    pub fn fill(&mut self, addrs: &[u64]) -> usize {
        if addrs.is_empty() {
            return 0;
        }

        let mut idx: u32 = 0;
        let ready = unsafe {
            _xsk_ring_prod__reserve(self.fq.as_mut(), addrs.len() as u64, &mut idx) as usize
        };

        for addr in &addrs[..ready] {
            unsafe {
                *_xsk_ring_prod__fill_addr(self.fq.as_mut(), idx) = *addr;
            }
            idx = idx.wrapping_add(1);
        }

        if ready > 0 {
            unsafe {
                _xsk_ring_prod__submit(self.fq.as_mut(), ready as u64);
            }
        }

        ready
    }

    #[inline]
    pub fn needs_wakeup(&mut self) -> bool {
        unsafe { _xsk_ring_prod__needs_wakeup(self.fq.as_mut()) != 0 }
    }
}
