//! The per-socket packet loop.
//!
//! A [`Session`] owns the frame pool, the arena tracking which frames userspace holds, the four
//! rings and the pipeline. It is driven by one thread and shares nothing with the control plane
//! except the policy store inside the pipeline.

use std::cmp::min;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arraydeque::{ArrayDeque, Wrapping};
use rlimit::{setrlimit, Resource, Rlim};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame::{FrameArena, FrameError};
use crate::mmap_area::{MmapArea, MmapAreaOptions, MmapError};
use crate::pipeline::{NeighborRedirect, Pipeline, RewritePolicy, Verdict};
use crate::program::{ProgramError, XdpProgram};
use crate::ring::{Desc, Rings, XskRings};
use crate::socket::{Socket, SocketError};
use crate::store::PolicyStore;
use crate::umem::{Umem, UmemError};
use crate::RX_BATCH_SIZE;

/// Upper bound on one blocking wait, so a shutdown request is seen within this time.
pub const POLL_TIMEOUT_MS: i32 = 1000;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("raising the memlock limit failed: {0}")]
    Memlock(#[source] io::Error),
    #[error(transparent)]
    Mmap(#[from] MmapError),
    #[error(transparent)]
    Umem(#[from] UmemError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("initial fill of the fill ring incomplete: wanted {wanted}, got {got}")]
    InitialFill { wanted: usize, got: usize },
    #[error("frame accounting: {0}")]
    Frame(#[from] FrameError),
    #[error("waiting for rx failed: {0}")]
    Wait(#[source] io::Error),
}

/// Cooperative stop signal shared between the signal handler and the loops it stops.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets the pipeline dropped.
    pub dropped: u64,
    /// Forwards dropped because the tx ring had no room.
    pub tx_full: u64,
}

impl Stats {
    fn log_since(&self, prev: &Stats, period: Duration) {
        let secs = period.as_secs_f64();
        let rate = |now: u64, then: u64| (now - then) as f64 / secs;

        info!(
            rx_packets = self.rx_packets,
            rx_pps = rate(self.rx_packets, prev.rx_packets) as u64,
            rx_mbps = rate(self.rx_bytes, prev.rx_bytes) * 8.0 / 1_000_000.0,
            tx_packets = self.tx_packets,
            tx_pps = rate(self.tx_packets, prev.tx_packets) as u64,
            tx_mbps = rate(self.tx_bytes, prev.tx_bytes) * 8.0 / 1_000_000.0,
            dropped = self.dropped,
            tx_full = self.tx_full,
            "stats"
        );
    }
}

/// Raise RLIMIT_MEMLOCK so the frame pool can be registered with the kernel.
pub fn raise_memlock_limit() -> Result<(), SessionError> {
    setrlimit(Resource::MEMLOCK, Rlim::INFINITY, Rlim::INFINITY).map_err(SessionError::Memlock)
}

pub struct Session<R: Rings, P: RewritePolicy = NeighborRedirect> {
    rings: R,
    area: Arc<MmapArea>,
    arena: FrameArena,
    pipeline: Pipeline<P>,
    rx_pending: ArrayDeque<[Desc; RX_BATCH_SIZE], Wrapping>,
    fill_scratch: Vec<u64>,
    comp_scratch: Vec<u64>,
    outstanding_tx: u32,
    batch_size: usize,
    poll_mode: bool,
    stats: Stats,
}

impl Session<XskRings> {
    /// Map the frame pool, create the umem and socket on the configured queue and prime the
    /// fill ring.
    ///
    /// When `program` is given it is a custom XDP program already attached to the interface,
    /// and the new socket is registered in its XSKMAP.
    pub fn open(
        config: &Config,
        store: Arc<PolicyStore>,
        program: Option<&XdpProgram>,
    ) -> Result<Session<XskRings>, SessionError> {
        let area = MmapArea::new(
            config.frame_count,
            config.frame_size,
            MmapAreaOptions {
                huge_tlb: config.huge_tlb,
            },
        )?;

        let (umem, cq, fq) = Umem::new(area.clone(), config.ring_size, config.ring_size)?;

        let (socket, rx, tx) = Socket::new(
            umem,
            &config.ifname,
            config.queue,
            config.ring_size,
            config.ring_size,
            config.socket_options(),
        )?;

        if let Some(program) = program {
            program.register_socket(config.queue as u32, socket.fd())?;
        }

        info!(
            ifname = %config.ifname,
            queue = config.queue,
            frames = config.frame_count,
            frame_size = config.frame_size,
            ring_size = config.ring_size,
            "AF_XDP socket open"
        );

        let mut session = Session::new(
            XskRings::new(fq, cq, rx, tx),
            area,
            Pipeline::new(store, NeighborRedirect),
            config.batch_size,
            config.poll_mode,
        );
        session.prime(config.ring_size)?;

        Ok(session)
    }
}

impl<R: Rings, P: RewritePolicy> Session<R, P> {
    /// Every frame of `area` starts out free. `batch_size` is clamped to 1..=RX_BATCH_SIZE.
    pub fn new(
        rings: R,
        area: Arc<MmapArea>,
        pipeline: Pipeline<P>,
        batch_size: usize,
        poll_mode: bool,
    ) -> Session<R, P> {
        let arena = FrameArena::new(area.frame_count() as u32, area.frame_size() as u32);
        let batch_size = min(batch_size, RX_BATCH_SIZE).max(1);

        Session {
            rings,
            area,
            arena,
            pipeline,
            rx_pending: ArrayDeque::new(),
            fill_scratch: Vec::with_capacity(RX_BATCH_SIZE),
            comp_scratch: Vec::with_capacity(batch_size),
            outstanding_tx: 0,
            batch_size,
            poll_mode,
            stats: Stats::default(),
        }
    }

    /// Hand `min(fill_ring_size, capacity)` frames to the fill ring. Anything short of that is
    /// fatal.
    pub fn prime(&mut self, fill_ring_size: u32) -> Result<usize, SessionError> {
        let wanted = min(fill_ring_size as usize, self.arena.capacity());

        let mut addrs = Vec::with_capacity(wanted);
        while addrs.len() < wanted {
            match self.arena.allocate() {
                Some(h) => addrs.push(self.arena.addr(h)),
                None => break,
            }
        }

        let got = self.rings.fill(&addrs);
        if got != wanted {
            for addr in &addrs[got..] {
                self.arena.release_addr(*addr)?;
            }
            return Err(SessionError::InitialFill { wanted, got });
        }

        debug!(frames = got, "fill ring primed");
        Ok(got)
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    pub fn arena(&self) -> &FrameArena {
        &self.arena
    }

    pub fn pipeline(&self) -> &Pipeline<P> {
        &self.pipeline
    }

    /// One pass of the loop. Returns the number of packets received.
    pub fn cycle(&mut self) -> Result<usize, SessionError> {
        if self.outstanding_tx > 0 {
            self.reap()?;
        }

        let rcvd = self.rings.receive(&mut self.rx_pending, self.batch_size);

        self.refill()?;

        while let Some(desc) = self.rx_pending.pop_front() {
            self.dispatch(desc)?;
        }

        if rcvd == 0 && self.poll_mode {
            self.rings
                .wait_rx(POLL_TIMEOUT_MS)
                .map_err(SessionError::Wait)?;
        }

        Ok(rcvd)
    }

    /// Loop until `shutdown` is triggered, logging stats once a second.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), SessionError> {
        let mut last = Instant::now();
        let mut prev = self.stats;

        while !shutdown.is_triggered() {
            self.cycle()?;

            let now = Instant::now();
            let period = now.duration_since(last);
            if period >= STATS_INTERVAL {
                self.stats.log_since(&prev, period);
                prev = self.stats;
                last = now;
            }
        }

        info!("dataplane loop stopped");
        Ok(())
    }

    /// Tear the session down: collect whatever the kernel already completed, report the frame
    /// accounting, then release the rings before the frame pool.
    pub fn close(mut self) -> Stats {
        if self.outstanding_tx > 0 {
            if let Err(e) = self.reap() {
                warn!(error = %e, "reaping completions on close failed");
            }
        }

        info!(
            free = self.arena.free_count(),
            in_flight = self.arena.in_flight(),
            outstanding_tx = self.outstanding_tx,
            rx_packets = self.stats.rx_packets,
            tx_packets = self.stats.tx_packets,
            "closing session"
        );

        let Session {
            rings, area, stats, ..
        } = self;
        drop(rings);
        drop(area);

        stats
    }

    fn reap(&mut self) -> Result<(), SessionError> {
        self.rings.kick_tx();

        self.comp_scratch.clear();
        let n = self.rings.complete(&mut self.comp_scratch, self.batch_size);
        for addr in &self.comp_scratch {
            self.arena.release_addr(*addr)?;
        }
        self.outstanding_tx = self.outstanding_tx.saturating_sub(n as u32);

        Ok(())
    }

    fn refill(&mut self) -> Result<(), SessionError> {
        loop {
            let wanted = self.rings.fill_free(self.arena.free_count() as u32) as usize;
            if wanted == 0 {
                return Ok(());
            }

            self.fill_scratch.clear();
            for _ in 0..wanted {
                match self.arena.allocate() {
                    Some(h) => self.fill_scratch.push(self.arena.addr(h)),
                    None => break,
                }
            }

            let n = self.rings.fill(&self.fill_scratch);
            for addr in &self.fill_scratch[n..] {
                self.arena.release_addr(*addr)?;
            }
            if n == self.fill_scratch.len() {
                return Ok(());
            }
        }
    }

    #[inline]
    fn dispatch(&mut self, desc: Desc) -> Result<(), SessionError> {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += desc.len as u64;

        // The frame came off the rx ring, nothing else references it until it is transmitted
        // or released.
        let verdict = match unsafe { self.area.frame_mut(desc.addr, desc.len as usize) } {
            Some(frame) => self.pipeline.process(frame),
            None => Verdict::Drop,
        };

        match verdict {
            Verdict::Forward => {
                if self.outstanding_tx < self.rings.tx_capacity() && self.rings.transmit(desc) {
                    self.outstanding_tx += 1;
                    self.stats.tx_packets += 1;
                    self.stats.tx_bytes += desc.len as u64;
                } else {
                    self.stats.tx_full += 1;
                    self.arena.release_addr(desc.addr)?;
                }
            }
            Verdict::Drop => {
                self.stats.dropped += 1;
                self.arena.release_addr(desc.addr)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use rand::Rng;

    use super::*;
    use crate::packet::build::{icmpv6_echo, vxlan, Tunnel};
    use crate::packet::{ETH_HLEN, IPV6_HLEN, ICMPV6_ECHO_REPLY};
    use crate::ring::mem::MemRings;

    const FRAMES: usize = 16;
    const FRAME_SIZE: usize = 2048;

    fn session(fill_size: usize, tx_size: usize) -> Session<MemRings> {
        session_with_mode(fill_size, tx_size, false)
    }

    fn session_with_mode(fill_size: usize, tx_size: usize, poll_mode: bool) -> Session<MemRings> {
        let area = MmapArea::new(FRAMES, FRAME_SIZE, MmapAreaOptions::default()).unwrap();
        let mut s = Session::new(
            MemRings::new(fill_size, tx_size),
            area,
            Pipeline::new(Arc::new(PolicyStore::new()), NeighborRedirect),
            RX_BATCH_SIZE,
            poll_mode,
        );
        s.prime(fill_size as u32).unwrap();
        s
    }

    fn echo() -> Vec<u8> {
        icmpv6_echo(
            "fe80::1".parse::<Ipv6Addr>().unwrap(),
            "fe80::2".parse::<Ipv6Addr>().unwrap(),
            None,
        )
    }

    /// Play the kernel: write `pkt` into the next fill frame and deliver it on rx.
    fn inject(s: &mut Session<MemRings>, pkt: &[u8]) -> Option<u64> {
        let addr = *s.rings.fill.front()?;
        let frame = unsafe { s.area.frame_mut(addr, pkt.len()) }.unwrap();
        frame.copy_from_slice(pkt);
        s.rings.deliver(pkt.len() as u32)
    }

    fn assert_conserved(s: &Session<MemRings>) {
        assert_eq!(
            s.arena.in_flight(),
            s.rings.held() + s.rx_pending.len(),
            "frames lost or duplicated"
        );
        assert_eq!(s.arena.free_count() + s.arena.in_flight(), FRAMES);
    }

    #[test]
    fn prime_fills_ring() {
        let s = session(8, 8);
        assert_eq!(s.rings.fill.len(), 8);
        assert_eq!(s.arena.in_flight(), 8);
        assert_conserved(&s);

        let s = session(32, 8);
        assert_eq!(s.rings.fill.len(), FRAMES);
        assert_eq!(s.arena.free_count(), 0);
    }

    #[test]
    fn short_initial_fill_is_fatal() {
        let area = MmapArea::new(FRAMES, FRAME_SIZE, MmapAreaOptions::default()).unwrap();
        let mut rings = MemRings::new(8, 8);
        rings.fill_refusals = 1;
        let mut s = Session::new(
            rings,
            area,
            Pipeline::new(Arc::new(PolicyStore::new()), NeighborRedirect),
            RX_BATCH_SIZE,
            false,
        );

        match s.prime(8) {
            Err(SessionError::InitialFill { wanted: 8, got: 0 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.arena.free_count(), FRAMES);
    }

    #[test]
    fn echo_is_answered_and_frame_returns() {
        let mut s = session(8, 8);
        let pkt = echo();
        let addr = inject(&mut s, &pkt).unwrap();

        assert_eq!(s.cycle().unwrap(), 1);
        assert_eq!(s.rings.tx.len(), 1);
        assert_eq!(s.rings.tx[0].addr, addr);
        assert_eq!(s.rings.tx[0].len as usize, pkt.len());
        assert_eq!(s.outstanding_tx(), 1);

        let frame = unsafe { s.area.frame_mut(addr, pkt.len()) }.unwrap();
        assert_eq!(frame[ETH_HLEN + IPV6_HLEN], ICMPV6_ECHO_REPLY);

        let st = s.stats();
        assert_eq!(st.rx_packets, 1);
        assert_eq!(st.rx_bytes, pkt.len() as u64);
        assert_eq!(st.tx_packets, 1);
        assert_eq!(st.tx_bytes, pkt.len() as u64);
        assert_conserved(&s);

        s.rings.complete_all();
        s.cycle().unwrap();
        assert_eq!(s.outstanding_tx(), 0);
        assert!(s.rings.kicks >= 1);
        assert!(s.rings.completion.is_empty());
        assert_conserved(&s);
    }

    #[test]
    fn dropped_frames_go_back_to_arena() {
        let mut s = session(8, 8);
        let mut pkt = echo();
        pkt[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        let addr = inject(&mut s, &pkt).unwrap();

        s.cycle().unwrap();
        assert!(s.rings.tx.is_empty());
        assert_eq!(s.stats().dropped, 1);
        assert_eq!(s.stats().tx_packets, 0);
        let h = s.arena.handle_for_addr(addr).unwrap();
        assert!(s.arena.is_free(h));
        assert_conserved(&s);
    }

    #[test]
    fn tunnel_miss_dropped() {
        let mut s = session(8, 8);
        inject(&mut s, &vxlan(&Tunnel::default())).unwrap();
        s.cycle().unwrap();
        assert_eq!(s.stats().dropped, 1);
        assert!(s.rings.tx.is_empty());
    }

    #[test]
    fn full_tx_ring_drops() {
        let mut s = session(8, 8);
        s.rings.tx_blocked = true;
        let addr = inject(&mut s, &echo()).unwrap();

        s.cycle().unwrap();
        assert_eq!(s.stats().tx_full, 1);
        assert_eq!(s.outstanding_tx(), 0);
        assert!(s.arena.is_free(s.arena.handle_for_addr(addr).unwrap()));
        assert_conserved(&s);
    }

    #[test]
    fn outstanding_bounded_by_tx_capacity() {
        let mut s = session(8, 2);
        for _ in 0..3 {
            inject(&mut s, &echo()).unwrap();
        }

        s.cycle().unwrap();
        assert_eq!(s.outstanding_tx(), 2);
        assert_eq!(s.stats().tx_packets, 2);
        assert_eq!(s.stats().tx_full, 1);
        assert_conserved(&s);
    }

    #[test]
    fn refused_refill_is_retried() {
        let mut s = session(8, 8);
        inject(&mut s, &echo()).unwrap();
        assert_eq!(s.rings.fill.len(), 7);
        s.rings.fill_refusals = 3;

        s.cycle().unwrap();
        assert_eq!(s.rings.fill_refusals, 0);
        assert_eq!(s.rings.fill.len(), 8);
        assert_conserved(&s);
    }

    #[test]
    fn bogus_completion_is_reported() {
        let mut s = session(8, 8);
        inject(&mut s, &echo()).unwrap();
        s.cycle().unwrap();

        // Highest frame is still free: LIFO hands out low indexes first.
        let free_addr = ((FRAMES - 1) * FRAME_SIZE) as u64;
        s.rings.completion.push_back(free_addr);

        match s.cycle() {
            Err(SessionError::Frame(FrameError::DoubleRelease(h))) => {
                assert_eq!(h.index() as usize, FRAMES - 1)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn conservation_under_random_traffic() {
        let mut s = session(8, 4);
        let mut rng = rand::thread_rng();
        let junk = vec![0u8; 60];
        let echo = echo();
        let tunnel = vxlan(&Tunnel {
            inner_dst: Ipv4Addr::new(10, 0, 0, 99),
            ..Default::default()
        });

        for _ in 0..2_000 {
            for _ in 0..rng.gen_range(0..6) {
                let pkt: &[u8] = match rng.gen_range(0..3) {
                    0 => &junk,
                    1 => &tunnel,
                    _ => &echo,
                };
                if inject(&mut s, pkt).is_none() {
                    break;
                }
            }
            if rng.gen_bool(0.3) {
                s.rings.tx_blocked = !s.rings.tx_blocked;
            }
            if rng.gen_bool(0.5) {
                s.rings.complete_all();
            }

            s.cycle().unwrap();
            assert_conserved(&s);
            assert!(s.outstanding_tx() <= 4);
        }

        let st = s.stats();
        assert_eq!(st.rx_packets, st.tx_packets + st.dropped + st.tx_full);
    }

    #[test]
    fn run_returns_once_shut_down() {
        let mut s = session(8, 8);
        let shutdown = Shutdown::new();
        shutdown.trigger();
        s.run(&shutdown).unwrap();
        assert_eq!(s.stats(), Stats::default());
    }

    #[test]
    fn close_reaps_and_reports() {
        let mut s = session(8, 8);
        inject(&mut s, &echo()).unwrap();
        s.cycle().unwrap();
        s.rings.complete_all();

        let stats = s.close();
        assert_eq!(stats.tx_packets, 1);
    }

    #[test]
    fn idle_cycle_waits_only_in_poll_mode() {
        let mut s = session_with_mode(8, 8, true);
        assert_eq!(s.cycle().unwrap(), 0);
        assert_eq!(s.rings.waits, 1);

        inject(&mut s, &echo()).unwrap();
        assert_eq!(s.cycle().unwrap(), 1);
        assert_eq!(s.rings.waits, 1);

        let mut s = session_with_mode(8, 8, false);
        for _ in 0..3 {
            s.cycle().unwrap();
        }
        assert_eq!(s.rings.waits, 0);
    }
}
