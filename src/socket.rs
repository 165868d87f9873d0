use std::cmp::min;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::Arc;

use arraydeque::{ArrayDeque, Wrapping};
use errno::errno;
use libbpf_sys::{
    _xsk_ring_cons__peek, _xsk_ring_cons__release, _xsk_ring_cons__rx_desc,
    _xsk_ring_prod__needs_wakeup, _xsk_ring_prod__reserve, _xsk_ring_prod__submit,
    _xsk_ring_prod__tx_desc, bpf_set_link_xdp_fd, xsk_ring_cons, xsk_ring_prod, xsk_socket,
    xsk_socket__create, xsk_socket__delete, xsk_socket__fd, xsk_socket_config, XDP_COPY,
    XDP_USE_NEED_WAKEUP, XDP_ZEROCOPY, XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD,
};
use libc::{if_nametoindex, poll, pollfd, sendto, EAGAIN, EBUSY, ENETDOWN, ENOBUFS, MSG_DONTWAIT, POLLIN};
use thiserror::Error;
use tracing::warn;

use crate::ring::Desc;
use crate::umem::Umem;
use crate::RX_BATCH_SIZE;

/// An AF_XDP socket bound to one interface queue.
#[derive(Debug)]
pub struct Socket {
    _umem: Arc<Umem>,
    socket: *mut xsk_socket,
}
unsafe impl Send for Socket {}
unsafe impl Sync for Socket {}

/// Rx half of a socket
#[derive(Debug)]
pub struct SocketRx {
    _socket: Arc<Socket>,
    fd: std::os::raw::c_int,
    rx: Box<xsk_ring_cons>,
}
unsafe impl Send for SocketRx {}

/// Tx half of a socket
#[derive(Debug)]
pub struct SocketTx {
    _socket: Arc<Socket>,
    fd: std::os::raw::c_int,
    tx: Box<xsk_ring_prod>,
    size: u32,
}
unsafe impl Send for SocketTx {}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket create on {0} queue {1} failed: {2}")]
    Create(String, usize, i32),
    #[error("interface name {0:?} is not valid")]
    InvalidName(String),
    #[error("no such interface {0}")]
    NoSuchInterface(String),
    #[error("detaching XDP program from {0} failed: {1}")]
    Detach(String, i32),
}

/// Configuration options for Socket
#[derive(Copy, Clone, Debug, Default)]
pub struct SocketOptions {
    /// Force XDP zero copy mode (XDP_ZEROCOPY flag)
    pub zero_copy_mode: bool,

    /// Force XDP copy mode (XDP_COPY flag)
    pub copy_mode: bool,

    /// XDP_FLAGS_* used when libbpf attaches its default program
    pub xdp_flags: u32,

    /// A custom XDP program is attached by the loader, libbpf must not load its own
    pub inhibit_prog_load: bool,
}

impl Socket {
    /// Create a new Rx/Tx AF_XDP socket
    pub fn new(
        umem: Arc<Umem>,
        if_name: &str,
        queue: usize,
        rx_ring_size: u32,
        tx_ring_size: u32,
        options: SocketOptions,
    ) -> Result<(Arc<Socket>, SocketRx, SocketTx), SocketError> {
        let mut cfg = xsk_socket_config {
            rx_size: rx_ring_size,
            tx_size: tx_ring_size,
            xdp_flags: options.xdp_flags,
            bind_flags: XDP_USE_NEED_WAKEUP as u16,
            libbpf_flags: 0,
        };

        if options.zero_copy_mode {
            cfg.bind_flags |= XDP_ZEROCOPY as u16;
        }

        if options.copy_mode {
            cfg.bind_flags |= XDP_COPY as u16;
        }

        if options.inhibit_prog_load {
            cfg.libbpf_flags |= XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD;
        }

        // Heap allocate since they are passed to the C function
        let mut rx: Box<xsk_ring_cons> = Default::default();
        let mut tx: Box<xsk_ring_prod> = Default::default();

        let mut xsk: *mut xsk_socket = ptr::null_mut();

        let if_name_c =
            CString::new(if_name).map_err(|_| SocketError::InvalidName(if_name.to_string()))?;

        let ret = unsafe {
            xsk_socket__create(
                &mut xsk,
                if_name_c.as_ptr(),
                queue as u32,
                umem.umem,
                rx.as_mut(),
                tx.as_mut(),
                &cfg,
            )
        };

        if ret != 0 || xsk.is_null() {
            return Err(SocketError::Create(if_name.to_string(), queue, ret));
        }

        let fd = unsafe { xsk_socket__fd(xsk) };
        let arc = Arc::new(Socket {
            _umem: umem,
            socket: xsk,
        });

        let rx = SocketRx {
            _socket: arc.clone(),
            fd,
            rx,
        };
        let tx = SocketTx {
            _socket: arc.clone(),
            fd,
            tx,
            size: tx_ring_size,
        };

        Ok((arc, rx, tx))
    }

    pub fn fd(&self) -> std::os::raw::c_int {
        unsafe { xsk_socket__fd(self.socket) }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            xsk_socket__delete(self.socket);
        }
    }
}

/// Remove whatever XDP program is attached to `if_name`.
pub fn detach_program(if_name: &str, xdp_flags: u32) -> Result<(), SocketError> {
    let if_name_c =
        CString::new(if_name).map_err(|_| SocketError::InvalidName(if_name.to_string()))?;

    let ifindex = unsafe { if_nametoindex(if_name_c.as_ptr()) };
    if ifindex == 0 {
        return Err(SocketError::NoSuchInterface(if_name.to_string()));
    }

    let ret = unsafe { bpf_set_link_xdp_fd(ifindex as i32, -1, xdp_flags) };
    if ret != 0 {
        return Err(SocketError::Detach(if_name.to_string(), ret));
    }

    Ok(())
}

impl SocketRx {
    /// Block until the socket is readable or `timeout_ms` passes. Returns whether there is data.
    #[inline]
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<bool> {
        let mut fds = [pollfd {
            fd: self.fd,
            events: POLLIN,
            revents: 0,
        }];

        let ret = unsafe { poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        Ok(ret > 0 && fds[0].revents & POLLIN != 0)
    }

    /// Move up to `batch_size` rx descriptors onto the back of `descs`.
    #[inline]
    pub fn try_recv(
        &mut self,
        descs: &mut ArrayDeque<[Desc; RX_BATCH_SIZE], Wrapping>,
        batch_size: usize,
    ) -> usize {
        let mut idx_rx: u32 = 0;
        let batch_size = min(descs.capacity() - descs.len(), batch_size);

        let rcvd = unsafe {
            _xsk_ring_cons__peek(self.rx.as_mut(), batch_size as u64, &mut idx_rx) as usize
        };
        if rcvd == 0 {
            // Note that the caller needs to check if the queue needs to be woken up
            return 0;
        }

        for _ in 0..rcvd {
            let desc = unsafe { *_xsk_ring_cons__rx_desc(self.rx.as_mut(), idx_rx) };

            // batch_size was bounded by the free space above, so nothing is evicted.
            let _ = descs.push_back(Desc {
                addr: desc.addr,
                len: desc.len,
            });

            idx_rx = idx_rx.wrapping_add(1);
        }

        unsafe {
            _xsk_ring_cons__release(self.rx.as_mut(), rcvd as u64);
        }

        rcvd
    }
}

impl SocketTx {
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Reserve exactly one tx slot and submit `desc` on it. Returns false when the ring is full.
    #[inline]
    pub fn send_one(&mut self, desc: Desc) -> bool {
        let mut idx_tx: u32 = 0;

        let ready = unsafe { _xsk_ring_prod__reserve(self.tx.as_mut(), 1, &mut idx_tx) };
        if ready != 1 {
            return false;
        }

        unsafe {
            let slot = _xsk_ring_prod__tx_desc(self.tx.as_mut(), idx_tx);
            (*slot).addr = desc.addr;
            (*slot).len = desc.len;
            _xsk_ring_prod__submit(self.tx.as_mut(), 1);
        }

        true
    }

    pub fn needs_wakeup(&mut self) -> bool {
        unsafe { _xsk_ring_prod__needs_wakeup(self.tx.as_mut()) != 0 }
    }

    /// Kick the kernel to process the tx ring if it asked for it.
    pub fn wakeup_if_required(&mut self) -> bool {
        if !self.needs_wakeup() {
            return false;
        }

        let ret = unsafe { sendto(self.fd, ptr::null(), 0, MSG_DONTWAIT, ptr::null(), 0) };
        if ret < 0 {
            match errno().0 {
                ENOBUFS | EAGAIN | EBUSY | ENETDOWN => {
                    // Transient, the next cycle kicks again
                }
                e => warn!(errno = e, "tx wakeup failed"),
            }
        }

        true
    }
}
