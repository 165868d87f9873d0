//! The four AF_XDP queues seen from the ring engine.

use std::io;

use arraydeque::{ArrayDeque, Wrapping};

use crate::socket::{SocketRx, SocketTx};
use crate::umem::{UmemCompletionQueue, UmemFillQueue};
use crate::RX_BATCH_SIZE;

/// A descriptor as carried on the rx and tx rings: umem address and packet length.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
}

/// Fill, completion, rx and tx queues of one socket session.
pub trait Rings {
    /// Free fill slots, at most `wanted`.
    fn fill_free(&mut self, wanted: u32) -> u32;

    /// Submit every address in `addrs` to the fill queue, or none of them. Returns the number
    /// submitted.
    fn fill(&mut self, addrs: &[u64]) -> usize;

    /// Append up to `max` completed tx addresses to `addrs`.
    fn complete(&mut self, addrs: &mut Vec<u64>, max: usize) -> usize;

    /// Move up to `max` rx descriptors onto `descs`.
    fn receive(&mut self, descs: &mut ArrayDeque<[Desc; RX_BATCH_SIZE], Wrapping>, max: usize)
        -> usize;

    /// Reserve one tx slot and submit `desc`. False when the ring is full.
    fn transmit(&mut self, desc: Desc) -> bool;

    fn tx_capacity(&self) -> u32;

    /// Wake the kernel's tx processing if it is waiting to be kicked.
    fn kick_tx(&mut self);

    /// Block until rx data arrives or `timeout_ms` passes.
    fn wait_rx(&mut self, timeout_ms: i32) -> io::Result<bool>;
}

/// Rings of a real AF_XDP socket.
#[derive(Debug)]
pub struct XskRings {
    pub(crate) fq: UmemFillQueue,
    pub(crate) cq: UmemCompletionQueue,
    pub(crate) rx: SocketRx,
    pub(crate) tx: SocketTx,
}

impl XskRings {
    pub fn new(
        fq: UmemFillQueue,
        cq: UmemCompletionQueue,
        rx: SocketRx,
        tx: SocketTx,
    ) -> XskRings {
        XskRings { fq, cq, rx, tx }
    }
}

impl Rings for XskRings {
    #[inline]
    fn fill_free(&mut self, wanted: u32) -> u32 {
        self.fq.nb_free(wanted)
    }

    #[inline]
    fn fill(&mut self, addrs: &[u64]) -> usize {
        self.fq.fill(addrs)
    }

    #[inline]
    fn complete(&mut self, addrs: &mut Vec<u64>, max: usize) -> usize {
        self.cq.service(addrs, max)
    }

    #[inline]
    fn receive(
        &mut self,
        descs: &mut ArrayDeque<[Desc; RX_BATCH_SIZE], Wrapping>,
        max: usize,
    ) -> usize {
        let n = self.rx.try_recv(descs, max);
        if n == 0 && self.fq.needs_wakeup() {
            // Let the kernel know the fill ring has been topped up.
            let _ = self.rx.wait(0);
        }
        n
    }

    #[inline]
    fn transmit(&mut self, desc: Desc) -> bool {
        self.tx.send_one(desc)
    }

    fn tx_capacity(&self) -> u32 {
        self.tx.size()
    }

    #[inline]
    fn kick_tx(&mut self) {
        self.tx.wakeup_if_required();
    }

    fn wait_rx(&mut self, timeout_ms: i32) -> io::Result<bool> {
        self.rx.wait(timeout_ms)
    }
}

#[cfg(test)]
pub(crate) mod mem {
    //! Rings backed by plain queues, with helpers playing the kernel's side.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Default)]
    pub struct MemRings {
        pub fill_size: usize,
        pub tx_size: usize,
        pub fill: VecDeque<u64>,
        pub completion: VecDeque<u64>,
        pub rx: VecDeque<Desc>,
        pub tx: VecDeque<Desc>,
        pub kicks: usize,
        pub waits: usize,
        /// Pretend the tx ring is always full.
        pub tx_blocked: bool,
        /// Refuse this many fill reservations before accepting.
        pub fill_refusals: usize,
    }

    impl MemRings {
        pub fn new(fill_size: usize, tx_size: usize) -> MemRings {
            MemRings {
                fill_size,
                tx_size,
                ..Default::default()
            }
        }

        /// Kernel side: take a fill frame and deliver it on rx. Returns the address used.
        pub fn deliver(&mut self, len: u32) -> Option<u64> {
            let addr = self.fill.pop_front()?;
            self.rx.push_back(Desc { addr, len });
            Some(addr)
        }

        /// Kernel side: finish transmitting everything on the tx ring.
        pub fn complete_all(&mut self) -> usize {
            let n = self.tx.len();
            while let Some(desc) = self.tx.pop_front() {
                self.completion.push_back(desc.addr);
            }
            n
        }

        /// Frames currently held by the rings.
        pub fn held(&self) -> usize {
            self.fill.len() + self.completion.len() + self.rx.len() + self.tx.len()
        }
    }

    impl Rings for MemRings {
        fn fill_free(&mut self, wanted: u32) -> u32 {
            std::cmp::min((self.fill_size - self.fill.len()) as u32, wanted)
        }

        fn fill(&mut self, addrs: &[u64]) -> usize {
            if self.fill_refusals > 0 {
                self.fill_refusals -= 1;
                return 0;
            }
            if self.fill.len() + addrs.len() > self.fill_size {
                return 0;
            }
            self.fill.extend(addrs.iter().copied());
            addrs.len()
        }

        fn complete(&mut self, addrs: &mut Vec<u64>, max: usize) -> usize {
            let n = std::cmp::min(max, self.completion.len());
            addrs.extend(self.completion.drain(..n));
            n
        }

        fn receive(
            &mut self,
            descs: &mut ArrayDeque<[Desc; RX_BATCH_SIZE], Wrapping>,
            max: usize,
        ) -> usize {
            let n = std::cmp::min(max, descs.capacity() - descs.len());
            let n = std::cmp::min(n, self.rx.len());
            for desc in self.rx.drain(..n) {
                let _ = descs.push_back(desc);
            }
            n
        }

        fn transmit(&mut self, desc: Desc) -> bool {
            if self.tx_blocked || self.tx.len() >= self.tx_size {
                return false;
            }
            self.tx.push_back(desc);
            true
        }

        fn tx_capacity(&self) -> u32 {
            self.tx_size as u32
        }

        fn kick_tx(&mut self) {
            self.kicks += 1;
        }

        fn wait_rx(&mut self, _timeout_ms: i32) -> io::Result<bool> {
            self.waits += 1;
            Ok(!self.rx.is_empty())
        }
    }
}
