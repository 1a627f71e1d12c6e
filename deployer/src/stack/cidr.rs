//! IPv4 CIDR blocks and subnet carving

use crate::stack::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// An IPv4 network in CIDR notation (host bits must be zero)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    network: u32,
    prefix: u8,
}

impl Cidr {
    /// Creates a block, rejecting prefixes over 32 and addresses with host bits set
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::InvalidCidr(format!("{addr}/{prefix}")));
        }
        let network = u32::from(addr);
        if network & !Self::mask(prefix) != 0 {
            return Err(Error::InvalidCidr(format!("{addr}/{prefix}")));
        }
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses covered by the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn last(&self) -> u32 {
        self.network | !Self::mask(self.prefix)
    }

    /// Returns true if `other` lies entirely within this block
    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && other.network & Self::mask(self.prefix) == self.network
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.network <= other.last() && other.network <= self.last()
    }

    /// Carves `count` consecutive `/mask` blocks from the start of this network
    pub fn subnets(&self, mask: u8, count: usize) -> Result<Vec<Cidr>, Error> {
        if mask < self.prefix || mask > 32 {
            return Err(Error::InvalidSubnetMask {
                network: *self,
                mask,
            });
        }
        let step = 1u64 << (32 - u32::from(mask));
        let available = self.size() / step;
        if count as u64 > available {
            return Err(Error::CidrExhausted {
                network: *self,
                mask,
                requested: count,
            });
        }
        (0..count as u64)
            .map(|i| {
                let network = u64::from(self.network) + i * step;
                Cidr::new(Ipv4Addr::from(network as u32), mask)
            })
            .collect()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidCidr(s.to_string()))?;
        Cidr::new(addr, prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
