//! Mirroring accepted policy updates into kernel maps.
//!
//! The XDP side reads neighbor and security group state from two maps pinned in bpffs. Their
//! key and value layouts are fixed `#[repr(C)]` structs. Addresses are stored in network byte
//! order, everything else in host order.

use std::ffi::CString;
use std::fmt;
use std::mem;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use errno::errno;
use libbpf_sys::{bpf_map_delete_elem, bpf_map_update_elem, bpf_obj_get, BPF_ANY};
use libc::{close, ENOENT};
use thiserror::Error;
use tracing::{debug, info};

use crate::policy::{Action, Direction, NeighborInfo, PolicyKey, PolicyValue, SecurityGroupRule};

/// Fixed width of a security group id in the rule map key.
pub const SG_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("opening pinned map {0}: errno {1}")]
    Open(PathBuf, i32),
    #[error("path {0} contains a NUL byte")]
    InvalidPath(PathBuf),
    #[error("security group id {0:?} is longer than {} bytes", SG_ID_LEN)]
    KeyTooLong(String),
    #[error("payload does not belong under key {0}")]
    Mismatch(String),
    #[error("{map} map update for {key} failed: errno {errno}")]
    Update {
        map: &'static str,
        key: String,
        errno: i32,
    },
    #[error("{map} map delete for {key} failed: errno {errno}")]
    Delete {
        map: &'static str,
        key: String,
        errno: i32,
    },
}

/// Receives every update the store accepted, in the order it was accepted.
pub trait MapMirror {
    fn mirror(&mut self, key: &PolicyKey, value: &PolicyValue) -> Result<(), MirrorError>;
}

/// Used when no kernel maps are configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoMirror;

impl MapMirror for NoMirror {
    fn mirror(&mut self, _key: &PolicyKey, _value: &PolicyValue) -> Result<(), MirrorError> {
        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighborMapKey {
    pub vni: u32,
    /// Inner IPv4 address, network byte order
    pub ip: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighborMapValue {
    /// Underlay host address, network byte order
    pub host_ip: [u8; 4],
    pub host_mac: [u8; 6],
    pub vpc_mac: [u8; 6],
}

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SgMapKey {
    /// NUL padded group id
    pub id: [u8; SG_ID_LEN],
}

impl fmt::Debug for SgMapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.id.iter().position(|b| *b == 0).unwrap_or(SG_ID_LEN);
        f.debug_struct("SgMapKey")
            .field("id", &String::from_utf8_lossy(&self.id[..end]))
            .finish()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SgMapValue {
    /// 0 ingress, 1 egress
    pub direction: u8,
    pub protocol: u8,
    /// 0 allow, 1 deny
    pub action: u8,
    pub prefix_len: u8,
    pub port_min: u16,
    pub port_max: u16,
    /// network byte order
    pub remote_ip: [u8; 4],
}

impl From<&NeighborInfo> for NeighborMapValue {
    fn from(info: &NeighborInfo) -> Self {
        NeighborMapValue {
            host_ip: info.host_ip.octets(),
            host_mac: info.host_mac,
            vpc_mac: info.vpc_mac,
        }
    }
}

impl From<&SecurityGroupRule> for SgMapValue {
    fn from(rule: &SecurityGroupRule) -> Self {
        SgMapValue {
            direction: match rule.direction {
                Direction::Ingress => 0,
                Direction::Egress => 1,
            },
            protocol: rule.protocol,
            action: match rule.action {
                Action::Allow => 0,
                Action::Deny => 1,
            },
            prefix_len: rule.prefix_len,
            port_min: rule.port_min,
            port_max: rule.port_max,
            remote_ip: rule.remote_ip.octets(),
        }
    }
}

impl SgMapKey {
    pub fn new(id: &str) -> Result<SgMapKey, MirrorError> {
        let bytes = id.as_bytes();
        // Keep room for the terminating NUL.
        if bytes.len() >= SG_ID_LEN {
            return Err(MirrorError::KeyTooLong(id.to_string()));
        }
        let mut key = SgMapKey { id: [0; SG_ID_LEN] };
        key.id[..bytes.len()].copy_from_slice(bytes);
        Ok(key)
    }
}

/// One map operation derived from an update.
#[derive(Debug, PartialEq, Eq)]
pub enum MapOp {
    UpdateNeighbor(NeighborMapKey, NeighborMapValue),
    DeleteNeighbor(NeighborMapKey),
    UpdateRule(SgMapKey, SgMapValue),
    DeleteRule(SgMapKey),
}

impl MapOp {
    /// Tombstones become deletes.
    pub fn encode(key: &PolicyKey, value: &PolicyValue) -> Result<MapOp, MirrorError> {
        match (key, value) {
            (PolicyKey::Neighbor { vni, ip }, PolicyValue::Neighbor(info)) => Ok(
                MapOp::UpdateNeighbor(
                    NeighborMapKey {
                        vni: vni.get(),
                        ip: ip.octets(),
                    },
                    info.into(),
                ),
            ),
            (PolicyKey::Neighbor { vni, ip }, PolicyValue::Deleted) => {
                Ok(MapOp::DeleteNeighbor(NeighborMapKey {
                    vni: vni.get(),
                    ip: ip.octets(),
                }))
            }
            (PolicyKey::SecurityGroup(id), PolicyValue::SecurityGroupRule(rule)) => {
                Ok(MapOp::UpdateRule(SgMapKey::new(id)?, rule.into()))
            }
            (PolicyKey::SecurityGroup(id), PolicyValue::Deleted) => {
                Ok(MapOp::DeleteRule(SgMapKey::new(id)?))
            }
            _ => Err(MirrorError::Mismatch(key.to_string())),
        }
    }
}

/// The two pinned maps. Either may be absent, updates for it are then skipped.
#[derive(Debug, Default)]
pub struct BpfMaps {
    neighbor_fd: Option<RawFd>,
    security_group_fd: Option<RawFd>,
}

fn open_pinned(path: &Path) -> Result<RawFd, MirrorError> {
    let path_c = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| MirrorError::InvalidPath(path.to_path_buf()))?;

    let fd = unsafe { bpf_obj_get(path_c.as_ptr()) };
    if fd < 0 {
        return Err(MirrorError::Open(path.to_path_buf(), errno().0));
    }

    info!(path = %path.display(), fd, "opened pinned map");
    Ok(fd)
}

fn update<K, V>(fd: RawFd, key: &K, value: &V) -> Result<(), i32> {
    debug_assert!(mem::size_of::<K>() > 0 && mem::size_of::<V>() > 0);
    let ret = unsafe {
        bpf_map_update_elem(
            fd,
            key as *const K as *const c_void,
            value as *const V as *const c_void,
            BPF_ANY as u64,
        )
    };
    if ret != 0 {
        return Err(errno().0);
    }
    Ok(())
}

fn delete<K>(fd: RawFd, key: &K) -> Result<(), i32> {
    let ret = unsafe { bpf_map_delete_elem(fd, key as *const K as *const c_void) };
    if ret != 0 {
        let e = errno().0;
        // Deleting what the map never had is already the desired state.
        if e != ENOENT {
            return Err(e);
        }
    }
    Ok(())
}

impl BpfMaps {
    pub fn open(
        neighbor: Option<&Path>,
        security_group: Option<&Path>,
    ) -> Result<BpfMaps, MirrorError> {
        let mut maps = BpfMaps::default();
        if let Some(path) = neighbor {
            maps.neighbor_fd = Some(open_pinned(path)?);
        }
        if let Some(path) = security_group {
            maps.security_group_fd = Some(open_pinned(path)?);
        }
        Ok(maps)
    }

    pub fn is_empty(&self) -> bool {
        self.neighbor_fd.is_none() && self.security_group_fd.is_none()
    }
}

impl MapMirror for BpfMaps {
    fn mirror(&mut self, key: &PolicyKey, value: &PolicyValue) -> Result<(), MirrorError> {
        let op = MapOp::encode(key, value)?;
        let failed_update = |map, errno| MirrorError::Update {
            map,
            key: key.to_string(),
            errno,
        };
        let failed_delete = |map, errno| MirrorError::Delete {
            map,
            key: key.to_string(),
            errno,
        };

        match (op, self.neighbor_fd, self.security_group_fd) {
            (MapOp::UpdateNeighbor(k, v), Some(fd), _) => {
                update(fd, &k, &v).map_err(|e| failed_update("neighbor", e))?
            }
            (MapOp::DeleteNeighbor(k), Some(fd), _) => {
                delete(fd, &k).map_err(|e| failed_delete("neighbor", e))?
            }
            (MapOp::UpdateRule(k, v), _, Some(fd)) => {
                update(fd, &k, &v).map_err(|e| failed_update("security group", e))?
            }
            (MapOp::DeleteRule(k), _, Some(fd)) => {
                delete(fd, &k).map_err(|e| failed_delete("security group", e))?
            }
            (op, _, _) => {
                debug!(?op, "no map configured, not mirrored");
                return Ok(());
            }
        }

        debug!(%key, "mirrored");
        Ok(())
    }
}

impl Drop for BpfMaps {
    fn drop(&mut self) {
        for fd in self.neighbor_fd.iter().chain(self.security_group_fd.iter()) {
            unsafe {
                close(*fd);
            }
        }
    }
}
