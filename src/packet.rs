//! Bounds-checked header views over a packet buffer.
//!
//! Every view is created by a `split` constructor which checks the buffer is long enough for the
//! header, splits it off the front and hands back the remaining bytes. Accessors then index
//! fixed offsets inside a slice whose length is already known to be sufficient.

use std::convert::TryInto;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const ETH_HLEN: usize = 14;
pub const IPV4_MIN_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const ICMP_ECHO_HLEN: usize = 8;
pub const UDP_HLEN: usize = 8;
pub const VXLAN_HLEN: usize = 8;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// IANA assigned VXLAN port.
pub const VXLAN_PORT: u16 = 4789;
/// "VNI present" bit in the first VXLAN flags byte.
pub const VXLAN_FLAG_VNI: u8 = 0x08;

#[inline]
fn split(buf: &mut [u8], len: usize) -> Option<(&mut [u8], &mut [u8])> {
    if buf.len() < len {
        return None;
    }
    Some(buf.split_at_mut(len))
}

#[inline]
fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

#[inline]
fn set_be16(b: &mut [u8], off: usize, val: u16) {
    b[off..off + 2].copy_from_slice(&val.to_be_bytes());
}

/// Ethernet II header.
#[derive(Debug)]
pub struct EthernetHdr<'a>(&'a mut [u8]);

impl<'a> EthernetHdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        let (hdr, rest) = split(buf, ETH_HLEN)?;
        Some((EthernetHdr(hdr), rest))
    }

    pub fn dst(&self) -> [u8; 6] {
        self.0[0..6].try_into().unwrap_or_default()
    }

    pub fn src(&self) -> [u8; 6] {
        self.0[6..12].try_into().unwrap_or_default()
    }

    pub fn set_dst(&mut self, mac: &[u8; 6]) {
        self.0[0..6].copy_from_slice(mac);
    }

    pub fn set_src(&mut self, mac: &[u8; 6]) {
        self.0[6..12].copy_from_slice(mac);
    }

    pub fn ethertype(&self) -> u16 {
        be16(self.0, 12)
    }

    pub fn swap_addrs(&mut self) {
        let (dst, rest) = self.0.split_at_mut(6);
        dst.swap_with_slice(&mut rest[..6]);
    }
}

/// IPv4 header, options included.
#[derive(Debug)]
pub struct Ipv4Hdr<'a>(&'a mut [u8]);

impl<'a> Ipv4Hdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        if buf.len() < IPV4_MIN_HLEN || buf[0] >> 4 != 4 {
            return None;
        }
        let hlen = ((buf[0] & 0x0f) as usize) * 4;
        if hlen < IPV4_MIN_HLEN {
            return None;
        }
        let (hdr, rest) = split(buf, hlen)?;
        Some((Ipv4Hdr(hdr), rest))
    }

    pub fn protocol(&self) -> u8 {
        self.0[9]
    }

    pub fn checksum(&self) -> u16 {
        be16(self.0, 10)
    }

    pub fn set_checksum(&mut self, sum: u16) {
        set_be16(self.0, 10, sum);
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[16], self.0[17], self.0[18], self.0[19])
    }

    /// Raw source address write. The header checksum is left to the caller.
    pub fn set_src(&mut self, addr: Ipv4Addr) {
        self.0[12..16].copy_from_slice(&addr.octets());
    }

    /// Raw destination address write. The header checksum is left to the caller.
    pub fn set_dst(&mut self, addr: Ipv4Addr) {
        self.0[16..20].copy_from_slice(&addr.octets());
    }

    /// Exchanging the two addresses leaves the header checksum valid.
    pub fn swap_addrs(&mut self) {
        let (src, dst) = self.0[12..20].split_at_mut(4);
        src.swap_with_slice(dst);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0
    }
}

/// Fixed IPv6 header. Extension headers are not followed.
#[derive(Debug)]
pub struct Ipv6Hdr<'a>(&'a mut [u8]);

impl<'a> Ipv6Hdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        if buf.is_empty() || buf[0] >> 4 != 6 {
            return None;
        }
        let (hdr, rest) = split(buf, IPV6_HLEN)?;
        Some((Ipv6Hdr(hdr), rest))
    }

    pub fn payload_len(&self) -> u16 {
        be16(self.0, 4)
    }

    pub fn next_header(&self) -> u8 {
        self.0[6]
    }

    pub fn src(&self) -> Ipv6Addr {
        let octets: [u8; 16] = self.0[8..24].try_into().unwrap_or_default();
        Ipv6Addr::from(octets)
    }

    pub fn dst(&self) -> Ipv6Addr {
        let octets: [u8; 16] = self.0[24..40].try_into().unwrap_or_default();
        Ipv6Addr::from(octets)
    }

    /// Exchanging the two addresses leaves the upper layer pseudo-header sum unchanged.
    pub fn swap_addrs(&mut self) {
        let (src, dst) = self.0[8..40].split_at_mut(16);
        src.swap_with_slice(dst);
    }
}

/// ICMP / ICMPv6 echo header (type, code, checksum, identifier, sequence).
#[derive(Debug)]
pub struct IcmpEchoHdr<'a>(&'a mut [u8]);

impl<'a> IcmpEchoHdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        let (hdr, rest) = split(buf, ICMP_ECHO_HLEN)?;
        Some((IcmpEchoHdr(hdr), rest))
    }

    pub fn msg_type(&self) -> u8 {
        self.0[0]
    }

    pub fn code(&self) -> u8 {
        self.0[1]
    }

    /// Type and code as the first 16 bit word of the message.
    pub fn type_word(&self) -> u16 {
        be16(self.0, 0)
    }

    pub fn set_msg_type(&mut self, t: u8) {
        self.0[0] = t;
    }

    pub fn checksum(&self) -> u16 {
        be16(self.0, 2)
    }

    pub fn set_checksum(&mut self, sum: u16) {
        set_be16(self.0, 2, sum);
    }
}

#[derive(Debug)]
pub struct UdpHdr<'a>(&'a mut [u8]);

impl<'a> UdpHdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        let (hdr, rest) = split(buf, UDP_HLEN)?;
        Some((UdpHdr(hdr), rest))
    }

    pub fn src_port(&self) -> u16 {
        be16(self.0, 0)
    }

    pub fn dst_port(&self) -> u16 {
        be16(self.0, 2)
    }

    pub fn checksum(&self) -> u16 {
        be16(self.0, 6)
    }

    pub fn set_checksum(&mut self, sum: u16) {
        set_be16(self.0, 6, sum);
    }
}

/// VXLAN header (RFC 7348).
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|R|R|R|I|R|R|R|               Reserved                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                VXLAN Network Identifier (VNI) |   Reserved    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug)]
pub struct VxlanHdr<'a>(&'a mut [u8]);

impl<'a> VxlanHdr<'a> {
    pub fn split(buf: &'a mut [u8]) -> Option<(Self, &'a mut [u8])> {
        let (hdr, rest) = split(buf, VXLAN_HLEN)?;
        Some((VxlanHdr(hdr), rest))
    }

    pub fn vni_present(&self) -> bool {
        self.0[0] & VXLAN_FLAG_VNI != 0
    }

    pub fn vni(&self) -> u32 {
        u32::from_be_bytes([0, self.0[4], self.0[5], self.0[6]])
    }
}
