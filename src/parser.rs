//! Read-only header parsing for the monitoring path.
//!
//! The parser extracts just enough L3/L4 metadata to populate the
//! monitoring ring. It never mutates packet bytes and never fails: a
//! truncated or malformed packet yields a best-effort [`PacketInfo`] with
//! the unparseable fields left at zero.

use std::fmt;
use std::time::Instant;

use crate::address::{format_ipv4, format_ipv6};
use crate::divert::DivertAddress;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// IPv4 or IPv6 address in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddress {
    V4(u32),
    V6([u32; 4]),
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => f.write_str(&format_ipv4(*addr)),
            IpAddress::V6(words) => f.write_str(&format_ipv6(*words)),
        }
    }
}

/// Parsed view of one captured packet, produced once per capture and pushed
/// into the monitoring ring. Never re-enters the pipeline.
#[derive(Debug, Clone)]
pub struct PacketInfo {
    /// 4 or 6; 0 when the version nibble is unrecognized.
    pub ip_version: u8,
    pub src_addr: IpAddress,
    pub dst_addr: IpAddress,
    /// Zero unless the packet is TCP or UDP with an intact L4 header.
    pub src_port: u16,
    pub dst_port: u16,
    /// L4 protocol number (next-header for IPv6).
    pub protocol: u8,
    /// On-wire length in bytes.
    pub length: u32,
    pub captured_at: Instant,
    pub outbound: bool,
    pub loopback: bool,
    pub if_idx: u32,
}

/// Stateless header parser.
pub struct PacketParser;

impl PacketParser {
    /// On-wire length of the packet starting at `data[0]`, recovered from
    /// the IP header: IPv4 total length, or IPv6 payload length plus the
    /// fixed 40-byte header. `None` when no length can be recovered, which
    /// ends batch walking.
    pub fn wire_len(data: &[u8]) -> Option<usize> {
        match data.first()? >> 4 {
            4 if data.len() >= 4 => {
                Some(u16::from_be_bytes([data[2], data[3]]) as usize)
            }
            6 if data.len() >= 6 => {
                Some(u16::from_be_bytes([data[4], data[5]]) as usize + IPV6_HEADER)
            }
            _ => None,
        }
    }

    /// Parse one packet into a [`PacketInfo`]. Tolerates truncation at any
    /// point; whatever cannot be read stays zeroed.
    pub fn parse(data: &[u8], addr: &DivertAddress, captured_at: Instant) -> PacketInfo {
        let mut info = PacketInfo {
            ip_version: 0,
            src_addr: IpAddress::V4(0),
            dst_addr: IpAddress::V4(0),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            length: data.len() as u32,
            captured_at,
            outbound: addr.outbound,
            loopback: addr.loopback,
            if_idx: addr.if_idx,
        };

        let Some(first) = data.first() else {
            return info;
        };

        match first >> 4 {
            4 if data.len() >= IPV4_MIN_HEADER => {
                info.ip_version = 4;
                info.protocol = data[9];
                info.src_addr = IpAddress::V4(u32::from_be_bytes([
                    data[12], data[13], data[14], data[15],
                ]));
                info.dst_addr = IpAddress::V4(u32::from_be_bytes([
                    data[16], data[17], data[18], data[19],
                ]));
                let header_len = ((data[0] & 0x0f) as usize) * 4;
                if header_len >= IPV4_MIN_HEADER {
                    Self::parse_ports(&mut info, data, header_len);
                }
            }
            6 if data.len() >= IPV6_HEADER => {
                info.ip_version = 6;
                info.protocol = data[6];
                let mut src = [0u32; 4];
                let mut dst = [0u32; 4];
                for i in 0..4 {
                    let s = 8 + i * 4;
                    let d = 24 + i * 4;
                    src[i] = u32::from_be_bytes([data[s], data[s + 1], data[s + 2], data[s + 3]]);
                    dst[i] = u32::from_be_bytes([data[d], data[d + 1], data[d + 2], data[d + 3]]);
                }
                info.src_addr = IpAddress::V6(src);
                info.dst_addr = IpAddress::V6(dst);
                // Extension headers are not walked; ports stay zero when the
                // next-header is not directly TCP or UDP.
                Self::parse_ports(&mut info, data, IPV6_HEADER);
            }
            _ => {}
        }

        info
    }

    fn parse_ports(info: &mut PacketInfo, data: &[u8], l4_offset: usize) {
        if info.protocol != PROTO_TCP && info.protocol != PROTO_UDP {
            return;
        }
        if data.len() < l4_offset + 4 {
            return;
        }
        info.src_port = u16::from_be_bytes([data[l4_offset], data[l4_offset + 1]]);
        info.dst_port = u16::from_be_bytes([data[l4_offset + 2], data[l4_offset + 3]]);
    }
}
