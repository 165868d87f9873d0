//
// Helpers shared by the integration tests.
//
#![allow(dead_code)]

use std::net::Ipv4Addr;

use vxwing::policy::{NeighborInfo, PolicyKey, PolicyValue, Vni};
use vxwing::sync::Update;

pub fn key(vni: u32, ip: [u8; 4]) -> PolicyKey {
    PolicyKey::neighbor(
        Vni::new(vni).unwrap(),
        Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
    )
}

/// A neighbor payload distinguishable by `tag`.
pub fn neighbor(tag: u8) -> PolicyValue {
    PolicyValue::Neighbor(NeighborInfo {
        host_ip: Ipv4Addr::new(172, 16, 0, tag),
        host_mac: [0x0c, 0, 0, 0, 0, tag],
        vpc_mac: [0x02, 0, 0, 0, 0, tag],
    })
}

pub fn update(key: &PolicyKey, version: u64, payload: PolicyValue) -> Update {
    Update {
        key: key.clone(),
        version,
        payload,
    }
}
