//! IPv4/TCP/UDP datagram parsing and construction.
//!
//! Parsing is a read-only view borrowing the source buffer; building always
//! allocates a fresh buffer with checksums in place.

pub mod checksum;
pub mod sni;

use bitflags::bitflags;
use std::net::Ipv4Addr;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TcpFlagSet: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Transport-layer detail available only for TCP datagrams.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlagSet,
    pub header_len: usize,
}

/// Parsed read-only view over one IPv4 datagram.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    pub version: u8,
    pub header_len: usize,
    pub protocol: u8,
    pub total_len: usize,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp: Option<TcpHeader>,
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse one datagram. Returns `None` for non-IPv4 or a buffer too short
    /// to hold an IP header. Anything else decodes tolerantly: fields the
    /// buffer cannot cover are left at zero and the payload comes back empty.
    pub fn parse(buffer: &'a [u8]) -> Option<Packet<'a>> {
        if buffer.len() < IPV4_HEADER_LEN {
            return None;
        }
        let version = buffer[0] >> 4;
        if version != 4 {
            return None;
        }
        let header_len = usize::from(buffer[0] & 0x0F) * 4;
        let protocol = buffer[9];
        let total_len = (u16::from_be_bytes([buffer[2], buffer[3]]) as usize).min(buffer.len());
        let src = Ipv4Addr::new(buffer[12], buffer[13], buffer[14], buffer[15]);
        let dst = Ipv4Addr::new(buffer[16], buffer[17], buffer[18], buffer[19]);

        let mut packet = Packet {
            version,
            header_len,
            protocol,
            total_len,
            src,
            dst,
            src_port: 0,
            dst_port: 0,
            tcp: None,
            payload: &[],
        };
        if header_len < IPV4_HEADER_LEN || header_len > total_len {
            return Some(packet);
        }
        let transport = &buffer[header_len..total_len];
        match protocol {
            PROTO_TCP => packet.parse_tcp(transport),
            PROTO_UDP => packet.parse_udp(transport),
            _ => {}
        }
        Some(packet)
    }

    fn parse_tcp(&mut self, transport: &'a [u8]) {
        if transport.len() < 4 {
            return;
        }
        self.src_port = u16::from_be_bytes([transport[0], transport[1]]);
        self.dst_port = u16::from_be_bytes([transport[2], transport[3]]);
        if transport.len() < TCP_HEADER_LEN {
            return;
        }
        let data_offset = usize::from(transport[12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > transport.len() {
            return;
        }
        self.tcp = Some(TcpHeader {
            seq: u32::from_be_bytes([transport[4], transport[5], transport[6], transport[7]]),
            ack: u32::from_be_bytes([transport[8], transport[9], transport[10], transport[11]]),
            flags: TcpFlagSet::from_bits_truncate(transport[13]),
            header_len: data_offset,
        });
        self.payload = &transport[data_offset..];
    }

    fn parse_udp(&mut self, transport: &'a [u8]) {
        if transport.len() < 4 {
            return;
        }
        self.src_port = u16::from_be_bytes([transport[0], transport[1]]);
        self.dst_port = u16::from_be_bytes([transport[2], transport[3]]);
        if transport.len() < UDP_HEADER_LEN {
            return;
        }
        let length = u16::from_be_bytes([transport[4], transport[5]]) as usize;
        if length < UDP_HEADER_LEN || length > transport.len() {
            return;
        }
        self.payload = &transport[UDP_HEADER_LEN..length];
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }
}

/// Build an IPv4+TCP datagram. `seq`/`ack` are the 32-bit wire values.
pub fn build_tcp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlagSet,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut buffer = vec![0u8; total_len];
    write_ipv4_header(&mut buffer, total_len, PROTO_TCP, src, dst);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[offset + 4..offset + 8].copy_from_slice(&seq.to_be_bytes());
    buffer[offset + 8..offset + 12].copy_from_slice(&ack.to_be_bytes());
    buffer[offset + 12] = (5u8) << 4; // data offset, no options
    buffer[offset + 13] = flags.bits();
    buffer[offset + 14..offset + 16].copy_from_slice(&65535u16.to_be_bytes()); // window
    buffer[offset + 16..offset + 18].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    buffer[offset + 18..offset + 20].copy_from_slice(&0u16.to_be_bytes()); // urgent pointer
    if !payload.is_empty() {
        buffer[offset + TCP_HEADER_LEN..].copy_from_slice(payload);
    }

    let tcp_checksum = checksum::tcp_ipv4(src, dst, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}

/// Build an IPv4+UDP datagram.
pub fn build_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];
    write_ipv4_header(&mut buffer, total_len, PROTO_UDP, src, dst);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[offset + 4..offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    // checksum placeholder at offset + 6..8
    if !payload.is_empty() {
        buffer[offset + UDP_HEADER_LEN..].copy_from_slice(payload);
    }

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[offset..]);
    buffer[offset + 6..offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
    buffer
}

fn write_ipv4_header(
    buffer: &mut [u8],
    total_len: usize,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) {
    buffer[0] = 0x45; // version + IHL
    buffer[1] = 0; // TOS
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buffer[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // Don't Fragment
    buffer[8] = 64; // TTL
    buffer[9] = protocol;
    buffer[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());
}
