// src/network/ip_pool.rs
//! Address block pool.
//!
//! This module carves the configured private ranges into disjoint /29
//! blocks and hands one out per client tunnel. Clients may declare
//! addresses they already use; the blocks containing them are never
//! handed out by this pool.

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::constants::{
    BLOCK_PREFIX, BLOCK_SIZE, CLIENT_GATEWAY_OFFSET, CLIENT_IP_OFFSET, SERVER_GATEWAY_OFFSET,
    SERVER_IP_OFFSET,
};

/// Error type for address pool operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("IP pool is exhausted")]
    PoolExhausted,

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),
}

/// A /29 block assigned to one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressBlock {
    base: Ipv4Addr,
}

impl AddressBlock {
    /// The block `ip` falls into
    pub fn containing(ip: Ipv4Addr) -> Self {
        Self {
            base: Ipv4Addr::from(u32::from(ip) & !(BLOCK_SIZE - 1)),
        }
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Gateway of the server-side TUN
    pub fn server_gateway(&self) -> Ipv4Addr {
        self.offset(SERVER_GATEWAY_OFFSET)
    }

    /// Address of the server-side TUN
    pub fn server_ip(&self) -> Ipv4Addr {
        self.offset(SERVER_IP_OFFSET)
    }

    /// Gateway of the client-side TUN
    pub fn client_gateway(&self) -> Ipv4Addr {
        self.offset(CLIENT_GATEWAY_OFFSET)
    }

    /// Address of the client-side TUN
    pub fn client_ip(&self) -> Ipv4Addr {
        self.offset(CLIENT_IP_OFFSET)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        Self::containing(ip) == *self
    }

    /// The block as a CIDR network
    pub fn network(&self) -> Ipv4Network {
        // base is aligned to BLOCK_PREFIX, which is always a valid prefix
        Ipv4Network::new(self.base, BLOCK_PREFIX).unwrap_or_else(|_| Ipv4Network::from(self.base))
    }

    // base is block-aligned and every offset is below BLOCK_SIZE
    fn offset(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + offset)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, BLOCK_PREFIX)
    }
}

/// Parse, normalize and validate the ranges a pool is built from.
///
/// Every range must hold at least one whole block and no two ranges may
/// overlap, otherwise the same block could be handed out twice.
pub fn parse_ranges<S: AsRef<str>>(ranges: &[S]) -> Result<Vec<Ipv4Network>, PoolError> {
    if ranges.is_empty() {
        return Err(PoolError::InvalidSubnet("no address ranges given".to_string()));
    }

    let mut networks: Vec<Ipv4Network> = Vec::with_capacity(ranges.len());
    for raw in ranges {
        let raw = raw.as_ref();
        let parsed = Ipv4Network::from_str(raw)
            .map_err(|e| PoolError::InvalidSubnet(format!("{}: {}", raw, e)))?;

        if parsed.prefix() > BLOCK_PREFIX {
            return Err(PoolError::InvalidSubnet(format!(
                "{} is smaller than a /{} block",
                raw, BLOCK_PREFIX
            )));
        }

        let network = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|e| PoolError::InvalidSubnet(format!("{}: {}", raw, e)))?;

        if let Some(other) = networks
            .iter()
            .find(|n| n.contains(network.network()) || network.contains(n.network()))
        {
            return Err(PoolError::InvalidSubnet(format!(
                "{} overlaps {}",
                network, other
            )));
        }

        networks.push(network);
    }

    Ok(networks)
}

#[derive(Debug)]
struct PoolState {
    /// Index of the range the cursor is in
    range: usize,
    /// Base of the next candidate block
    cursor: u64,
    reserved: HashSet<AddressBlock>,
    allocated: HashSet<AddressBlock>,
}

/// Block allocator shared by all handshakes
#[derive(Debug)]
pub struct AddressPool {
    ranges: Vec<Ipv4Network>,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Create a pool over the given CIDR ranges, walked in order
    pub fn new<S: AsRef<str>>(ranges: &[S]) -> Result<Self, PoolError> {
        let ranges = parse_ranges(ranges)?;
        let cursor = u64::from(u32::from(ranges[0].network()));

        let pool = Self {
            ranges,
            state: Mutex::new(PoolState {
                range: 0,
                cursor,
                reserved: HashSet::new(),
                allocated: HashSet::new(),
            }),
        };

        info!(
            "Created address pool with {} blocks over {} range(s)",
            pool.capacity(),
            pool.ranges.len()
        );

        Ok(pool)
    }

    /// Mark the block containing `ip` as unavailable for future allocation.
    ///
    /// Addresses outside the pool's ranges are accepted and ignored.
    pub fn reserve(&self, ip: IpAddr) -> Result<(), PoolError> {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .ok_or_else(|| PoolError::MalformedAddress(ip.to_string()))?,
        };

        // Blocks outside every range are never handed out anyway
        if !self.ranges.iter().any(|range| range.contains(v4)) {
            debug!("Ignoring declared address {} outside the pool", v4);
            return Ok(());
        }

        let block = AddressBlock::containing(v4);
        if self.state.lock().reserved.insert(block) {
            debug!("Reserved block {} (declared unavailable: {})", block, v4);
        }

        Ok(())
    }

    /// Parse a client-declared address and reserve its block
    pub fn reserve_declared(&self, raw: &str) -> Result<(), PoolError> {
        let ip = IpAddr::from_str(raw.trim())
            .map_err(|_| PoolError::MalformedAddress(raw.to_string()))?;
        self.reserve(ip)
    }

    /// Allocate the next free block.
    ///
    /// The cursor only moves forward, so each block is returned at most
    /// once for the lifetime of the pool.
    pub fn next(&self) -> Result<AddressBlock, PoolError> {
        let mut state = self.state.lock();

        while let Some(range) = self.ranges.get(state.range) {
            let last = u64::from(u32::from(range.broadcast()));
            if state.cursor > last {
                state.range += 1;
                if let Some(next) = self.ranges.get(state.range) {
                    state.cursor = u64::from(u32::from(next.network()));
                }
                continue;
            }

            // cursor <= last, so it fits in an IPv4 address
            let block = AddressBlock::containing(Ipv4Addr::from(state.cursor as u32));
            state.cursor += u64::from(BLOCK_SIZE);

            if state.reserved.contains(&block) {
                debug!("Skipping reserved block {}", block);
                continue;
            }

            state.allocated.insert(block);
            debug!("Allocated block {}", block);
            return Ok(block);
        }

        warn!(
            "Address pool exhausted after {} allocations",
            state.allocated.len()
        );
        Err(PoolError::PoolExhausted)
    }

    /// Total number of blocks in the pool
    pub fn capacity(&self) -> u64 {
        self.ranges
            .iter()
            .map(|range| (1u64 << (32 - u32::from(range.prefix()))) / u64::from(BLOCK_SIZE))
            .sum()
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.state.lock().reserved.len()
    }

    pub fn is_allocated(&self, block: &AddressBlock) -> bool {
        self.state.lock().allocated.contains(block)
    }

    pub fn ranges(&self) -> &[Ipv4Network] {
        &self.ranges
    }
}
