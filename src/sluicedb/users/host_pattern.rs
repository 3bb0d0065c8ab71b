use std::net::IpAddr;

use strum::Display;

use crate::sluicedb::mysql::protocol::Subnet;
use crate::sluicedb::mysql::protocol::proxy_protocol::normalize_ip;

#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PatternType {
    /// A literal IPv4 or IPv6 address
    Address,
    /// base/netmask or base/prefix
    Mask,
    /// An address with % or _ wildcards, e.g. 192.168.%
    Wildcard,
    /// A host name, possibly with wildcards. Needs the client's host name.
    Hostname,
    /// Something that can never match, e.g. a malformed mask
    Unknown,
}

/// Index of the first unescaped % or _ in a pattern.
pub fn first_wildcard(pattern: &str) -> Option<usize> {
    let b = pattern.as_bytes();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 1,
            b'%' | b'_' => return Some(i),
            _ => (),
        }
        i += 1;
    }
    // The empty pattern means any host
    if pattern.is_empty() { Some(0) } else { None }
}

pub fn pattern_type(pattern: &str) -> PatternType {
    if pattern.is_empty() || pattern == "%" {
        return PatternType::Wildcard;
    }
    if pattern.parse::<IpAddr>().is_ok() {
        return PatternType::Address;
    }
    if pattern.contains('/') {
        return match pattern.parse::<Subnet>() {
            Ok(_) => PatternType::Mask,
            Err(_) => PatternType::Unknown,
        };
    }
    let address_like = pattern.bytes().all(|c| c.is_ascii_digit() || matches!(c, b'.' | b':' | b'%' | b'_'));
    if address_like {
        PatternType::Wildcard
    } else {
        PatternType::Hostname
    }
}

pub fn is_loopback(addr: &IpAddr) -> bool {
    normalize_ip(*addr).is_loopback()
}

/// Does the client address match the pattern? Hostname patterns never match an address,
/// except "localhost" which matches loopback clients.
pub fn address_matches(addr: &IpAddr, pattern: &str, ptype: PatternType) -> bool {
    let addr = normalize_ip(*addr);
    match ptype {
        PatternType::Address => match pattern.parse::<IpAddr>() {
            Ok(p) => normalize_ip(p) == addr,
            Err(_) => false,
        },
        PatternType::Mask => match pattern.parse::<Subnet>() {
            Ok(subnet) => subnet.contains(&addr),
            Err(_) => false,
        },
        PatternType::Wildcard => pattern.is_empty() || like_match(pattern, &addr.to_string(), false),
        PatternType::Hostname => pattern.eq_ignore_ascii_case("localhost") && addr.is_loopback(),
        PatternType::Unknown => false,
    }
}

/// Does the client host name match a Hostname pattern? Case-insensitive.
pub fn hostname_matches(hostname: &str, pattern: &str) -> bool {
    like_match(pattern, hostname, true)
}

/// SQL LIKE matching: % matches any run of characters, _ exactly one, \ escapes the next.
pub fn like_match(pattern: &str, s: &str, case_insensitive: bool) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    let eq = |a: char, b: char| {
        if case_insensitive {
            a.to_lowercase().eq(b.to_lowercase())
        } else {
            a == b
        }
    };

    // Iterative matching with a single backtrack point for the last %
    let (mut pi, mut si) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() {
            match p[pi] {
                '%' => {
                    star = Some((pi, si));
                    pi += 1;
                    continue;
                },
                '_' => {
                    pi += 1;
                    si += 1;
                    continue;
                },
                '\\' if pi + 1 < p.len() => {
                    if eq(p[pi + 1], s[si]) {
                        pi += 2;
                        si += 1;
                        continue;
                    }
                },
                c => {
                    if eq(c, s[si]) {
                        pi += 1;
                        si += 1;
                        continue;
                    }
                },
            }
        }
        match star {
            Some((sp, ss)) => {
                pi = sp + 1;
                si = ss + 1;
                star = Some((sp, ss + 1));
            },
            None => return false,
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(addr: &str, pattern: &str) -> bool {
        address_matches(&addr.parse().unwrap(), pattern, pattern_type(pattern))
    }

    #[test]
    fn test_pattern_type() {
        assert_eq!(pattern_type("%"), PatternType::Wildcard);
        assert_eq!(pattern_type("192.168.1.5"), PatternType::Address);
        assert_eq!(pattern_type("::1"), PatternType::Address);
        assert_eq!(pattern_type("10.0.0.0/255.255.255.0"), PatternType::Mask);
        assert_eq!(pattern_type("10.0.0.0/24"), PatternType::Mask);
        assert_eq!(pattern_type("10.0.0.0/255.0.255.0"), PatternType::Unknown);
        assert_eq!(pattern_type("192.168.%"), PatternType::Wildcard);
        assert_eq!(pattern_type("%.example.com"), PatternType::Hostname);
        assert_eq!(pattern_type("localhost"), PatternType::Hostname);
    }

    #[test]
    fn test_wildcard_address() {
        assert!(matches("192.168.1.5", "192.168.%"));
        assert!(matches("::ffff:192.168.1.5", "192.168.%"));
        assert!(!matches("192.169.1.5", "192.168.%"));
        assert!(matches("10.0.0.7", "10.0.0._"));
        assert!(!matches("10.0.0.17", "10.0.0._"));
        assert!(matches("172.16.0.1", "%"));
        assert!(matches("172.16.0.1", ""));
    }

    #[test]
    fn test_mask() {
        assert!(matches("10.0.0.200", "10.0.0.0/255.255.255.0"));
        assert!(matches("10.0.0.200", "10.0.0.0/24"));
        assert!(matches("::ffff:10.0.0.200", "10.0.0.0/24"));
        assert!(!matches("10.0.1.1", "10.0.0.0/24"));
    }

    #[test]
    fn test_address_and_localhost() {
        assert!(matches("::ffff:127.0.0.1", "127.0.0.1"));
        assert!(matches("127.0.0.1", "localhost"));
        assert!(matches("::1", "localhost"));
        assert!(!matches("10.1.1.1", "localhost"));
        assert!(!matches("10.1.1.1", "db.example.com"));
    }

    #[test]
    fn test_hostname_matches() {
        assert!(hostname_matches("App1.Example.com", "%.example.com"));
        assert!(!hostname_matches("example.com", "%.example.com"));
        assert!(hostname_matches("web7", "web_"));
    }

    #[test]
    fn test_like_match_escapes() {
        assert!(like_match(r"my\_db", "my_db", false));
        assert!(!like_match(r"my\_db", "myxdb", false));
        assert!(like_match("my_db", "myxdb", false));
        assert!(like_match("test%", "test", false));
        assert!(like_match("%a%b%", "xxaxxbxx", false));
        assert!(!like_match("Test%", "test1", false));
        assert!(like_match("Test%", "test1", true));
    }
}
