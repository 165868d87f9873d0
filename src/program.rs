//! Loading a custom XDP object instead of libbpf's built-in redirect program.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::Path;

use libbpf_sys::{
    bpf_map__fd, bpf_map_update_elem, bpf_object, bpf_object__close,
    bpf_object__find_map_by_name, bpf_object__find_program_by_title, bpf_object__load,
    bpf_object__open, bpf_program__fd, bpf_set_link_xdp_fd, libbpf_get_error,
    XDP_FLAGS_UPDATE_IF_NOEXIST,
};
use libc::if_nametoindex;
use thiserror::Error;
use tracing::{info, warn};

/// Name of the XSKMAP the redirect program looks sockets up in.
pub const XSKS_MAP: &str = "xsks_map";

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("{0:?} contains a NUL byte")]
    InvalidName(String),
    #[error("no such interface {0}")]
    NoSuchInterface(String),
    #[error("opening BPF object {0} failed: {1}")]
    Open(String, i64),
    #[error("loading BPF object {0} failed: {1}")]
    Load(String, i32),
    #[error("no program in section {0}")]
    NoSection(String),
    #[error("attaching XDP program to {0} failed: {1}")]
    Attach(String, i32),
    #[error("detaching XDP program from {0} failed: {1}")]
    Detach(String, i32),
    #[error("no map named {0} in the object")]
    NoMap(String),
    #[error("registering socket fd {1} for queue {0} failed: {2}")]
    Register(u32, i32, i32),
}

fn c_string(s: &str) -> Result<CString, ProgramError> {
    CString::new(s).map_err(|_| ProgramError::InvalidName(s.to_string()))
}

/// A loaded BPF object whose XDP program is attached to an interface. Dropping it detaches the
/// program again, so every exit path after a successful attach leaves the interface clean.
#[derive(Debug)]
pub struct XdpProgram {
    obj: *mut bpf_object,
    ifname: String,
    ifindex: u32,
    xdp_flags: u32,
    attached: bool,
}
unsafe impl Send for XdpProgram {}

impl XdpProgram {
    /// Open and load the ELF object at `path`, then attach the program found in section
    /// `progsec` to `ifname` with `xdp_flags`.
    pub fn load_and_attach(
        ifname: &str,
        path: &Path,
        progsec: &str,
        xdp_flags: u32,
    ) -> Result<XdpProgram, ProgramError> {
        let path_str = path.to_string_lossy().into_owned();
        let path_c = c_string(&path_str)?;
        let ifname_c = c_string(ifname)?;
        let progsec_c = c_string(progsec)?;

        let ifindex = unsafe { if_nametoindex(ifname_c.as_ptr()) };
        if ifindex == 0 {
            return Err(ProgramError::NoSuchInterface(ifname.to_string()));
        }

        let obj = unsafe { bpf_object__open(path_c.as_ptr()) };
        let err = unsafe { libbpf_get_error(obj as *const c_void) };
        if obj.is_null() || err != 0 {
            return Err(ProgramError::Open(path_str, err as i64));
        }
        // From here on `prog` closes the object on every error path.
        let mut prog = XdpProgram {
            obj,
            ifname: ifname.to_string(),
            ifindex,
            xdp_flags,
            attached: false,
        };

        let ret = unsafe { bpf_object__load(obj) };
        if ret != 0 {
            return Err(ProgramError::Load(path_str, ret));
        }

        let bpf_prog = unsafe { bpf_object__find_program_by_title(obj, progsec_c.as_ptr()) };
        if bpf_prog.is_null() {
            return Err(ProgramError::NoSection(progsec.to_string()));
        }
        let prog_fd = unsafe { bpf_program__fd(bpf_prog) };
        if prog_fd < 0 {
            return Err(ProgramError::NoSection(progsec.to_string()));
        }

        let ret = unsafe { bpf_set_link_xdp_fd(ifindex as i32, prog_fd, xdp_flags) };
        if ret != 0 {
            return Err(ProgramError::Attach(ifname.to_string(), ret));
        }
        prog.attached = true;

        info!(ifname, path = %path_str, progsec, "attached XDP program");

        Ok(prog)
    }

    pub fn map_fd(&self, name: &str) -> Result<i32, ProgramError> {
        let name_c = c_string(name)?;
        let map = unsafe { bpf_object__find_map_by_name(self.obj, name_c.as_ptr()) };
        if map.is_null() {
            return Err(ProgramError::NoMap(name.to_string()));
        }
        let fd = unsafe { bpf_map__fd(map) };
        if fd < 0 {
            return Err(ProgramError::NoMap(name.to_string()));
        }
        Ok(fd)
    }

    /// Point `queue`'s XSKMAP slot at the socket `socket_fd`, so the program redirects that
    /// queue's traffic to it.
    pub fn register_socket(&self, queue: u32, socket_fd: i32) -> Result<(), ProgramError> {
        let map_fd = self.map_fd(XSKS_MAP)?;
        let ret = unsafe {
            bpf_map_update_elem(
                map_fd,
                &queue as *const u32 as *const c_void,
                &socket_fd as *const i32 as *const c_void,
                0,
            )
        };
        if ret != 0 {
            return Err(ProgramError::Register(queue, socket_fd, ret));
        }
        Ok(())
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Remove the program from the interface. Later calls, and the one in `Drop`, are no-ops.
    pub fn detach(&mut self) -> Result<(), ProgramError> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;

        // The object owns the flags it attached with. UPDATE_IF_NOEXIST only matters on attach.
        let flags = self.xdp_flags & !XDP_FLAGS_UPDATE_IF_NOEXIST;
        let ret = unsafe { bpf_set_link_xdp_fd(self.ifindex as i32, -1, flags) };
        if ret != 0 {
            return Err(ProgramError::Detach(self.ifname.clone(), ret));
        }

        info!(ifname = %self.ifname, "detached XDP program");
        Ok(())
    }
}

impl Drop for XdpProgram {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(error = %e, "leaving XDP program attached");
        }
        unsafe {
            bpf_object__close(self.obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    fn attached_to_missing_interface() -> XdpProgram {
        XdpProgram {
            obj: ptr::null_mut(),
            ifname: "vxw-gone0".into(),
            ifindex: u32::MAX,
            xdp_flags: 0,
            attached: true,
        }
    }

    #[test]
    fn detach_reports_failure_once() {
        let mut prog = attached_to_missing_interface();
        assert!(matches!(prog.detach(), Err(ProgramError::Detach(..))));
        assert!(!prog.attached);
        assert!(prog.detach().is_ok());
    }

    #[test]
    fn drop_detaches_and_tolerates_failure() {
        let prog = attached_to_missing_interface();
        drop(prog);
    }

    #[test]
    fn missing_interface_is_rejected_before_loading() {
        let err = XdpProgram::load_and_attach(
            "vxw-gone0",
            Path::new("/nonexistent/prog.o"),
            "xdp_sock",
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ProgramError::NoSuchInterface(_)));
    }
}
