use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::sluicedb::{Error, Result};

const V1_PREFIX: &[u8] = b"PROXY ";
const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\0\r\nQUIT\n";
const V2_HEADER_LEN: usize = 16;

#[derive(Debug, Eq, PartialEq)]
pub enum ProxyHeader {
    /// More bytes are needed to decide
    Incomplete,
    /// The data doesn't start with a proxy protocol header
    Absent,
    /// A complete header of len bytes. source is None for LOCAL/UNKNOWN headers,
    /// which mean the connection's own address should be used.
    Parsed { len: usize, source: Option<SocketAddr> },
}

/// Inspects the start of a client stream for a proxy protocol v1 or v2 header.
pub fn parse_proxy_header(data: &[u8]) -> Result<ProxyHeader> {
    if data.is_empty() {
        return Ok(ProxyHeader::Incomplete);
    }
    if data[0] == b'P' {
        let n = data.len().min(V1_PREFIX.len());
        if data[..n] != V1_PREFIX[..n] {
            return Ok(ProxyHeader::Absent);
        }
        if data.len() < V1_PREFIX.len() {
            return Ok(ProxyHeader::Incomplete);
        }
        return parse_v1(data);
    }
    if data[0] == b'\r' {
        let n = data.len().min(V2_SIGNATURE.len());
        if data[..n] != V2_SIGNATURE[..n] {
            return Ok(ProxyHeader::Absent);
        }
        return parse_v2(data);
    }
    Ok(ProxyHeader::Absent)
}

fn parse_v1(data: &[u8]) -> Result<ProxyHeader> {
    let search = &data[..data.len().min(V1_MAX_LEN)];
    let end = match memchr::memchr(b'\n', search) {
        Some(i) => i,
        None if data.len() >= V1_MAX_LEN => return Err(Error::protocol_error("proxy protocol v1 header too long")),
        None => return Ok(ProxyHeader::Incomplete),
    };
    if end == 0 || data[end - 1] != b'\r' {
        return Err(Error::protocol_error("proxy protocol v1 header not terminated by CRLF"));
    }
    let line = std::str::from_utf8(&data[V1_PREFIX.len()..end - 1])?;
    let mut parts = line.split(' ');
    let family = parts.next().unwrap_or("");
    if family == "UNKNOWN" {
        return Ok(ProxyHeader::Parsed { len: end + 1, source: None });
    }
    let fields: Vec<&str> = parts.collect();
    if fields.len() != 4 {
        return Err(Error::protocol_error(format!("invalid proxy protocol v1 header: {}", line)));
    }
    let src: IpAddr = fields[0].parse()?;
    let port: u16 = fields[2].parse()?;
    match (family, src) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => (),
        _ => return Err(Error::protocol_error(format!("invalid proxy protocol v1 address family: {}", line))),
    }
    Ok(ProxyHeader::Parsed { len: end + 1, source: Some(SocketAddr::new(src, port)) })
}

fn parse_v2(data: &[u8]) -> Result<ProxyHeader> {
    if data.len() < V2_HEADER_LEN {
        return Ok(ProxyHeader::Incomplete);
    }
    let ver_cmd = data[12];
    if ver_cmd >> 4 != 2 {
        return Err(Error::protocol_error("unsupported proxy protocol version"));
    }
    let family = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let len = V2_HEADER_LEN + addr_len;
    if data.len() < len {
        return Ok(ProxyHeader::Incomplete);
    }
    let addrs = &data[V2_HEADER_LEN..len];
    match ver_cmd & 0x0f {
        0 => return Ok(ProxyHeader::Parsed { len, source: None }), // LOCAL
        1 => (), // PROXY
        _ => return Err(Error::protocol_error("invalid proxy protocol v2 command")),
    }
    let source = match family >> 4 {
        1 if addrs.len() >= 12 => {
            let ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let port = u16::from_be_bytes([addrs[8], addrs[9]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        },
        2 if addrs.len() >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&addrs[..16]);
            let port = u16::from_be_bytes([addrs[32], addrs[33]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        },
        // AF_UNSPEC or AF_UNIX, use the connection address
        0 | 3 => None,
        _ => return Err(Error::protocol_error("invalid proxy protocol v2 address block")),
    };
    Ok(ProxyHeader::Parsed { len, source })
}

/// A network in addr/prefix, addr/netmask or plain address form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (normalize_ip(*addr), self.addr) {
            (IpAddr::V4(a), IpAddr::V4(n)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(a) & mask == u32::from(n) & mask
            },
            (IpAddr::V6(a), IpAddr::V6(n)) => {
                let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - self.prefix as u32) };
                u128::from(a) & mask == u128::from(n) & mask
            },
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr_s, mask_s) = match s.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (s, None),
        };
        let addr = normalize_ip(addr_s.parse::<IpAddr>()?);
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match mask_s {
            None => max_prefix,
            Some(m) if m.contains('.') => {
                let mask: Ipv4Addr = m.parse()?;
                let bits = u32::from(mask);
                if bits.leading_ones() + bits.trailing_zeros() != 32 {
                    return Err(Error::new(format!("invalid netmask in {}", s)));
                }
                bits.leading_ones() as u8
            },
            Some(m) => {
                let p: u8 = m.parse()?;
                if p > max_prefix {
                    return Err(Error::new(format!("invalid prefix length in {}", s)));
                }
                p
            },
        };
        Ok(Subnet { addr, prefix })
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) }
}

/// Maps IPv4-mapped IPv6 addresses (::ffff:a.b.c.d) to plain IPv4.
pub fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// True if a client at addr may send a proxy protocol header.
pub fn is_proxy_protocol_allowed(addr: &IpAddr, networks: &[Subnet]) -> bool {
    networks.iter().any(|n| n.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_header() {
        let data = b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nrest";
        match parse_proxy_header(data).unwrap() {
            ProxyHeader::Parsed { len, source } => {
                assert_eq!(&data[len..], b"rest");
                assert_eq!(source, Some("192.168.0.1:56324".parse().unwrap()));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_proxy_header(b"PROXY TCP4 192.168").unwrap(), ProxyHeader::Incomplete);
        assert_eq!(parse_proxy_header(b"PRO").unwrap(), ProxyHeader::Incomplete);
        assert_eq!(parse_proxy_header(b"PROXY UNKNOWN\r\n").unwrap(), ProxyHeader::Parsed { len: 15, source: None });
        assert!(parse_proxy_header(b"PROXY TCP4 1.2.3.4\r\n").is_err());
    }

    #[test]
    fn test_v2_header() {
        let mut data = V2_SIGNATURE.to_vec();
        data.extend_from_slice(&[0x21, 0x11, 0, 12, 10, 0, 0, 5, 10, 0, 0, 1, 0x1f, 0x90, 0x0c, 0xea]);
        match parse_proxy_header(&data).unwrap() {
            ProxyHeader::Parsed { len, source } => {
                assert_eq!(len, 28);
                assert_eq!(source, Some("10.0.0.5:8080".parse().unwrap()));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_proxy_header(&data[..20]).unwrap(), ProxyHeader::Incomplete);
    }

    #[test]
    fn test_absent() {
        // a HandshakeResponse starts with the packet length
        assert_eq!(parse_proxy_header(&[0x55, 0, 0, 1]).unwrap(), ProxyHeader::Absent);
        assert_eq!(parse_proxy_header(b"PING").unwrap(), ProxyHeader::Absent);
    }

    #[test]
    fn test_subnet() {
        let net: Subnet = "10.0.0.0/24".parse().unwrap();
        assert!(net.contains(&"10.0.0.5".parse().unwrap()));
        assert!(!net.contains(&"10.0.1.5".parse().unwrap()));
        assert!(net.contains(&"::ffff:10.0.0.7".parse().unwrap()));
        let net: Subnet = "192.168.0.0/255.255.0.0".parse().unwrap();
        assert!(net.contains(&"192.168.77.1".parse().unwrap()));
        assert!("10.0.0.0/255.0.255.0".parse::<Subnet>().is_err());
        let host: Subnet = "::1".parse().unwrap();
        assert!(host.contains(&"::1".parse().unwrap()));
        assert!(is_proxy_protocol_allowed(&"10.0.0.5".parse().unwrap(), &["10.0.0.0/8".parse().unwrap()]));
    }
}
