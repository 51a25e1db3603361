//! Multicast group allocation out of a configured CIDR.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use shared::error::{Error, Result};

/// Hands out multicast group addresses from a CIDR range, reusing released
/// groups before exhausting the range.
#[derive(Debug)]
pub(crate) struct MulticastAllocator {
    base: u32,
    size: u32,
    next: u32,
    in_use: HashSet<u32>,
}

impl MulticastAllocator {
    pub(crate) fn new(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| Error::Other(format!("bad multicast CIDR {cidr}")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Other(format!("bad multicast CIDR {cidr}")))?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| Error::Other(format!("bad multicast CIDR {cidr}")))?;
        if prefix > 32 || !addr.is_multicast() {
            return Err(Error::Other(format!("bad multicast CIDR {cidr}")));
        }

        let size = if prefix == 32 { 1 } else { 1u32 << (32 - prefix) };
        Ok(Self {
            base: u32::from(addr),
            size,
            next: 0,
            in_use: HashSet::new(),
        })
    }

    pub(crate) fn allocate(&mut self) -> Result<Ipv4Addr> {
        for _ in 0..self.size {
            let offset = self.next % self.size;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(offset) {
                return Ok(Ipv4Addr::from(self.base + offset));
            }
        }
        Err(Error::MulticastExhausted)
    }

    pub(crate) fn release(&mut self, group: Ipv4Addr) {
        let offset = u32::from(group).wrapping_sub(self.base);
        self.in_use.remove(&offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_sequentially() {
        let mut a = MulticastAllocator::new("239.64.0.0/30").unwrap();
        assert_eq!(a.allocate().unwrap(), Ipv4Addr::new(239, 64, 0, 0));
        assert_eq!(a.allocate().unwrap(), Ipv4Addr::new(239, 64, 0, 1));
    }

    #[test]
    fn test_release_and_reuse() {
        let mut a = MulticastAllocator::new("239.64.0.0/31").unwrap();
        let g0 = a.allocate().unwrap();
        let _g1 = a.allocate().unwrap();
        assert!(matches!(a.allocate(), Err(Error::MulticastExhausted)));
        a.release(g0);
        assert_eq!(a.allocate().unwrap(), g0);
    }

    #[test]
    fn test_rejects_unicast_range() {
        assert!(MulticastAllocator::new("10.0.0.0/24").is_err());
        assert!(MulticastAllocator::new("239.0.0.0").is_err());
    }
}
