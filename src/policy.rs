//! Keys and payloads cached from the control plane.

use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::Mac;

/// 24 bit VXLAN network identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Vni(u32);

impl Vni {
    pub const MAX: u32 = 0x00ff_ffff;

    pub fn new(vni: u32) -> Option<Vni> {
        if vni > Self::MAX {
            return None;
        }
        Some(Vni(vni))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("vni {0} does not fit in 24 bits")]
    VniRange(u32),
    #[error("malformed neighbor key {0:?}, expected <vni>-<ipv4>")]
    Malformed(String),
}

impl TryFrom<u32> for Vni {
    type Error = KeyError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Vni::new(v).ok_or(KeyError::VniRange(v))
    }
}

impl From<Vni> for u32 {
    fn from(v: Vni) -> u32 {
        v.0
    }
}

impl fmt::Display for Vni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKey {
    /// An overlay address inside a tunnel.
    Neighbor { vni: Vni, ip: Ipv4Addr },
    /// An opaque security group id.
    SecurityGroup(String),
}

impl PolicyKey {
    pub fn neighbor(vni: Vni, ip: Ipv4Addr) -> PolicyKey {
        PolicyKey::Neighbor { vni, ip }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKey::Neighbor { vni, ip } => write!(f, "{}-{}", vni, ip),
            PolicyKey::SecurityGroup(id) => write!(f, "sg:{}", id),
        }
    }
}

/// Parses the `<vni>-<ipv4>` neighbor form.
impl FromStr for PolicyKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("sg:") {
            return Ok(PolicyKey::SecurityGroup(id.to_string()));
        }

        let malformed = || KeyError::Malformed(s.to_string());
        let (vni, ip) = s.split_once('-').ok_or_else(malformed)?;
        let vni: u32 = vni.parse().map_err(|_| malformed())?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| malformed())?;

        Ok(PolicyKey::Neighbor {
            vni: Vni::try_from(vni)?,
            ip,
        })
    }
}

/// Where an overlay address lives on the underlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub host_ip: Ipv4Addr,
    pub host_mac: [u8; 6],
    pub vpc_mac: [u8; 6],
}

impl fmt::Display for NeighborInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host {} ({}) vpc mac {}",
            self.host_ip,
            Mac(&self.host_mac),
            Mac(&self.vpc_mac)
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub direction: Direction,
    /// IP protocol number, 0 for any
    pub protocol: u8,
    pub port_min: u16,
    pub port_max: u16,
    pub remote_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub action: Action,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyValue {
    Neighbor(NeighborInfo),
    SecurityGroupRule(SecurityGroupRule),
    /// Tombstone. Versioned like any other payload so a late, older update cannot resurrect the
    /// key.
    Deleted,
}

impl PolicyValue {
    pub fn is_deleted(&self) -> bool {
        matches!(self, PolicyValue::Deleted)
    }
}
