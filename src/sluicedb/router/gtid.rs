use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::sluicedb::{Error, Result};

/// A MariaDB GTID: domain-server_id-sequence
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl FromStr for Gtid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, '-');
        let (domain, server_id, sequence) = match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(s), Some(n)) => (d, s, n),
            _ => return Err(Error::new(format!("invalid gtid {}", s))),
        };
        Ok(Gtid {
            domain: domain.parse()?,
            server_id: server_id.parse()?,
            sequence: sequence.parse()?,
        })
    }
}

impl Display for Gtid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

/// A replication position, one GTID per domain, as in @@gtid_current_pos.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct GtidPosition {
    domains: BTreeMap<u32, Gtid>,
}

impl GtidPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn get(&self, domain: u32) -> Option<&Gtid> {
        self.domains.get(&domain)
    }

    /// Records gtid if it's ahead of what we have for its domain.
    pub fn update(&mut self, gtid: Gtid) {
        let current = self.domains.entry(gtid.domain).or_insert(gtid);
        if gtid.sequence > current.sequence {
            *current = gtid;
        }
    }

    pub fn merge(&mut self, other: &GtidPosition) {
        for gtid in other.domains.values() {
            self.update(*gtid);
        }
    }

    /// True if this position has replicated everything in target.
    pub fn is_caught_up(&self, target: &GtidPosition) -> bool {
        target.domains.values().all(|t| {
            self.domains.get(&t.domain).map(|g| g.sequence >= t.sequence).unwrap_or(false)
        })
    }
}

impl FromStr for GtidPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut pos = GtidPosition::new();
        for part in s.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                pos.update(part.parse()?);
            }
        }
        Ok(pos)
    }
}

impl Display for GtidPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in self.domains.values() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}", gtid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        let pos: GtidPosition = "0-1-100, 1-2-5".parse().unwrap();
        assert_eq!(pos.get(0).map(|g| g.sequence), Some(100));
        assert_eq!(pos.get(1).map(|g| g.server_id), Some(2));
        assert_eq!(pos.to_string(), "0-1-100,1-2-5");
        assert!("".parse::<GtidPosition>().unwrap().is_empty());
        assert!("0-1".parse::<GtidPosition>().is_err());
    }

    #[test]
    fn test_caught_up() {
        let replica: GtidPosition = "0-1-100,1-2-5".parse().unwrap();
        assert!(replica.is_caught_up(&"0-1-99".parse().unwrap()));
        assert!(replica.is_caught_up(&"0-1-100,1-2-5".parse().unwrap()));
        assert!(!replica.is_caught_up(&"0-1-101".parse().unwrap()));
        assert!(!replica.is_caught_up(&"2-1-1".parse().unwrap()));
        assert!(replica.is_caught_up(&GtidPosition::new()));
    }

    #[test]
    fn test_update_keeps_highest() {
        let mut pos = GtidPosition::new();
        pos.update("0-1-10".parse().unwrap());
        pos.update("0-2-7".parse().unwrap());
        assert_eq!(pos.to_string(), "0-1-10");
        pos.update("0-2-11".parse().unwrap());
        assert_eq!(pos.to_string(), "0-2-11");
    }
}
