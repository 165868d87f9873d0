//! Per-packet classification and in-place rewrite.
//!
//! Two packet classes are handled: ICMP/ICMPv6 echo requests, answered by turning the frame
//! around, and VXLAN traffic, which is looked up in the policy store and handed to a
//! [`RewritePolicy`]. Everything else is dropped. Nothing here allocates.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::csum;
use crate::packet::{
    EthernetHdr, IcmpEchoHdr, Ipv4Hdr, Ipv6Hdr, UdpHdr, VxlanHdr, ETH_P_IP, ETH_P_IPV6,
    ICMPV6_ECHO_REPLY, ICMPV6_ECHO_REQUEST, ICMP_ECHO_HLEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST,
    IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_UDP, VXLAN_PORT,
};
use crate::policy::{PolicyKey, PolicyValue, Vni};
use crate::store::PolicyStore;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Send the (rewritten) frame back out of the interface.
    Forward,
    /// Hand the frame back to the arena.
    Drop,
}

/// A parsed VXLAN frame. The outer headers stay writable, the inner addresses are copied out.
#[derive(Debug)]
pub struct TunnelPacket<'a> {
    pub outer_eth: EthernetHdr<'a>,
    pub outer_ip: Ipv4Hdr<'a>,
    pub udp: UdpHdr<'a>,
    pub vni: Vni,
    pub inner_src: Ipv4Addr,
    pub inner_dst: Ipv4Addr,
}

impl<'a> TunnelPacket<'a> {
    /// Parse a whole frame.
    pub fn parse(frame: &'a mut [u8]) -> Option<TunnelPacket<'a>> {
        let (eth, rest) = EthernetHdr::split(frame)?;
        if eth.ethertype() != ETH_P_IP {
            return None;
        }
        let (ip, rest) = Ipv4Hdr::split(rest)?;
        Self::from_parts(eth, ip, rest)
    }

    /// Continue parsing after the outer IPv4 header.
    fn from_parts(
        outer_eth: EthernetHdr<'a>,
        outer_ip: Ipv4Hdr<'a>,
        rest: &'a mut [u8],
    ) -> Option<TunnelPacket<'a>> {
        if outer_ip.protocol() != IPPROTO_UDP {
            return None;
        }
        let (udp, rest) = UdpHdr::split(rest)?;
        if udp.dst_port() != VXLAN_PORT {
            return None;
        }
        let (vxlan, rest) = VxlanHdr::split(rest)?;
        if !vxlan.vni_present() {
            return None;
        }
        let vni = Vni::new(vxlan.vni())?;

        let (inner_eth, rest) = EthernetHdr::split(rest)?;
        if inner_eth.ethertype() != ETH_P_IP {
            return None;
        }
        let (inner_ip, _) = Ipv4Hdr::split(rest)?;

        Some(TunnelPacket {
            outer_eth,
            outer_ip,
            udp,
            vni,
            inner_src: inner_ip.src(),
            inner_dst: inner_ip.dst(),
        })
    }

    /// The store key for the inner destination.
    pub fn key(&self) -> PolicyKey {
        PolicyKey::neighbor(self.vni, self.inner_dst)
    }
}

/// What to do with a tunnel packet whose key was found in the store.
pub trait RewritePolicy {
    fn rewrite(&self, pkt: &mut TunnelPacket<'_>, value: &PolicyValue) -> Verdict;
}

impl<F> RewritePolicy for F
where
    F: Fn(&mut TunnelPacket<'_>, &PolicyValue) -> Verdict,
{
    fn rewrite(&self, pkt: &mut TunnelPacket<'_>, value: &PolicyValue) -> Verdict {
        self(pkt, value)
    }
}

/// Send the encapsulated frame on to the host the neighbor entry points at.
///
/// The outer frame is readdressed from this node to the resolved host. The outer IPv4 checksum
/// is updated incrementally and the outer UDP checksum is cleared, which RFC 7348 permits for
/// VXLAN over IPv4.
#[derive(Copy, Clone, Debug, Default)]
pub struct NeighborRedirect;

impl RewritePolicy for NeighborRedirect {
    fn rewrite(&self, pkt: &mut TunnelPacket<'_>, value: &PolicyValue) -> Verdict {
        let info = match value {
            PolicyValue::Neighbor(info) => info,
            _ => return Verdict::Drop,
        };

        let this_mac = pkt.outer_eth.dst();
        pkt.outer_eth.set_src(&this_mac);
        pkt.outer_eth.set_dst(&info.host_mac);

        let old_src = pkt.outer_ip.src();
        let this_ip = pkt.outer_ip.dst();
        let mut sum = pkt.outer_ip.checksum();
        sum = csum::replace4(sum, u32::from(old_src), u32::from(this_ip));
        sum = csum::replace4(sum, u32::from(this_ip), u32::from(info.host_ip));
        pkt.outer_ip.set_src(this_ip);
        pkt.outer_ip.set_dst(info.host_ip);
        pkt.outer_ip.set_checksum(sum);

        pkt.udp.set_checksum(0);

        Verdict::Forward
    }
}

pub struct Pipeline<P = NeighborRedirect> {
    store: Arc<PolicyStore>,
    policy: P,
}

impl<P: RewritePolicy> Pipeline<P> {
    pub fn new(store: Arc<PolicyStore>, policy: P) -> Pipeline<P> {
        Pipeline { store, policy }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Classify `frame` and rewrite it in place.
    pub fn process(&self, frame: &mut [u8]) -> Verdict {
        let (eth, rest) = match EthernetHdr::split(frame) {
            Some(v) => v,
            None => return Verdict::Drop,
        };

        match eth.ethertype() {
            ETH_P_IPV6 => echo_v6(eth, rest),
            ETH_P_IP => {
                let (ip, rest) = match Ipv4Hdr::split(rest) {
                    Some(v) => v,
                    None => return Verdict::Drop,
                };
                match ip.protocol() {
                    IPPROTO_ICMP => echo_v4(eth, ip, rest),
                    IPPROTO_UDP => match TunnelPacket::from_parts(eth, ip, rest) {
                        Some(pkt) => self.tunnel(pkt),
                        None => Verdict::Drop,
                    },
                    _ => Verdict::Drop,
                }
            }
            _ => Verdict::Drop,
        }
    }

    fn tunnel(&self, mut pkt: TunnelPacket<'_>) -> Verdict {
        match self.store.get(&pkt.key()) {
            Some((_, value)) => self.policy.rewrite(&mut pkt, &value),
            None => Verdict::Drop,
        }
    }
}

/// Rewrite the echo message type, fixing the checksum incrementally. The type and code share
/// the first 16 bit word of the message.
pub fn set_echo_type(icmp: &mut IcmpEchoHdr<'_>, new_type: u8) {
    let old = icmp.type_word();
    icmp.set_msg_type(new_type);
    let new = icmp.type_word();
    icmp.set_checksum(csum::replace2(icmp.checksum(), old, new));
}

fn echo_v6(mut eth: EthernetHdr<'_>, rest: &mut [u8]) -> Verdict {
    let (mut ip, rest) = match Ipv6Hdr::split(rest) {
        Some(v) => v,
        None => return Verdict::Drop,
    };
    if ip.next_header() != IPPROTO_ICMPV6 || (ip.payload_len() as usize) < ICMP_ECHO_HLEN {
        return Verdict::Drop;
    }
    let (mut icmp, _) = match IcmpEchoHdr::split(rest) {
        Some(v) => v,
        None => return Verdict::Drop,
    };
    if icmp.msg_type() != ICMPV6_ECHO_REQUEST {
        return Verdict::Drop;
    }

    eth.swap_addrs();
    ip.swap_addrs();
    set_echo_type(&mut icmp, ICMPV6_ECHO_REPLY);

    Verdict::Forward
}

fn echo_v4(mut eth: EthernetHdr<'_>, mut ip: Ipv4Hdr<'_>, rest: &mut [u8]) -> Verdict {
    let (mut icmp, _) = match IcmpEchoHdr::split(rest) {
        Some(v) => v,
        None => return Verdict::Drop,
    };
    if icmp.msg_type() != ICMP_ECHO_REQUEST {
        return Verdict::Drop;
    }

    eth.swap_addrs();
    ip.swap_addrs();
    set_echo_type(&mut icmp, ICMP_ECHO_REPLY);

    Verdict::Forward
}
