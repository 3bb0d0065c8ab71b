use std::str::FromStr;

use crate::sluicedb::common::{Result, Error};


/// A semantic version (major, minor, patch) where each component
/// can be no larger than 255.
#[derive(Eq, PartialEq, PartialOrd, Ord, Copy, Clone, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    /// Create a new version with the given (major, minor, patch) components.
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Version{
            major, minor, patch
        }
    }

    /// The numeric form used by @@version_comment style comparisons, e.g. 100611 for 10.6.11
    pub fn as_number(&self) -> u32 {
        self.major as u32 * 10000 + self.minor as u32 * 100 + self.patch as u32
    }
}

impl Default for Version {
    /// Return a new (0, 0, 0) version.
    fn default() -> Self {
        Version::new(0, 0, 0)
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Parse version from a server version string like "10.6.11-MariaDB-log".
    /// The first dotted xxx[.yyy][.zzz] run is used; any suffix after a component
    /// is ignored. The "5.5.5-" prefix older MariaDB servers send for replication
    /// compatibility is skipped.
    fn from_str(s: &str) -> Result<Self> {
        let mut version_str = s.split_whitespace().next().unwrap_or(s);
        if let Some(rest) = version_str.strip_prefix("5.5.5-") {
            version_str = rest;
        }
        let mut it = version_str.split('.');
        let major = leading_number(it.next().unwrap_or("0"))?;
        let minor = leading_number(it.next().unwrap_or("0"))?;
        let patch = leading_number(it.next().unwrap_or("0"))?;
        Ok(Self::new(major, minor, patch))
    }
}

fn leading_number(s: &str) -> Result<u8> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return Ok(0);
    }
    s[..end].parse().map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mariadb_version() {
        let v: Version = "10.6.11-MariaDB-log".parse().unwrap();
        assert_eq!(v, Version::new(10, 6, 11));
        assert_eq!(v.as_number(), 100611);
        let v: Version = "5.5.5-10.3.8-MariaDB".parse().unwrap();
        assert_eq!(v, Version::new(10, 3, 8));
        let v: Version = "8.0".parse().unwrap();
        assert_eq!(v, Version::new(8, 0, 0));
    }

    #[test]
    fn test_parse_invalid_version() {
        assert!("300.1.1".parse::<Version>().is_err());
    }
}
