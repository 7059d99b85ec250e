//! IP/CIDR allocator.
//!
//! Hands out non-overlapping CIDRs from named pools and remembers which CR
//! owns each one. Allocation is keyed by owner UID, so retrying the same
//! request for the same owner returns the CIDR handed out the first time.
//!
//! Addresses of both families are handled as `u128` offsets; a size request
//! is served first-fit at the lowest address aligned to the requested size.

use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Allocator errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("unknown IP pool '{0}'")]
    UnknownPool(String),

    #[error("IP pool '{pool}' has no free block of {size} addresses")]
    PoolExhausted { pool: String, size: u128 },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidRequest(String),
}

/// What a caller asks the allocator for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// Any free block of this many addresses (power of two)
    Size(u32),
    /// Exactly this CIDR
    Explicit(IpNetwork),
}

impl AllocationRequest {
    fn satisfied_by(&self, cidr: &IpNetwork) -> bool {
        match self {
            AllocationRequest::Size(size) => cidr_len(cidr) == u128::from(*size),
            AllocationRequest::Explicit(net) => net == cidr,
        }
    }
}

/// A CIDR held by one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub pool: String,
    pub cidr: IpNetwork,
    pub owner: String,
}

/// Address accounting for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub allocated: u128,
    pub capacity: u128,
}

#[derive(Debug, Default)]
struct Pool {
    blocks: Vec<IpNetwork>,
    // owner UID -> allocation
    records: HashMap<String, Allocation>,
}

impl Pool {
    fn contains(&self, net: &IpNetwork) -> bool {
        self.blocks.iter().any(|b| net_within(b, net))
    }

    fn overlapping(&self, net: &IpNetwork) -> Option<&Allocation> {
        self.records.values().find(|r| overlaps(&r.cidr, net))
    }

    fn find_free(&self, size: u32) -> Option<IpNetwork> {
        let size = u128::from(size);
        for block in &self.blocks {
            let (start, end) = span(block);
            if size > end - start {
                continue;
            }
            let bits = family_bits(block);
            let prefix = u8::try_from(bits - size.trailing_zeros()).ok()?;

            let mut taken: Vec<(u128, u128)> = self
                .records
                .values()
                .filter(|r| r.cidr.is_ipv4() == block.is_ipv4())
                .map(|r| span(&r.cidr))
                .filter(|(s, e)| *s < end && start < *e)
                .collect();
            taken.sort_unstable();

            // Block starts are aligned to the block size, which is a multiple of `size`
            let mut candidate = start;
            while candidate.checked_add(size).is_some_and(|c| c <= end) {
                let candidate_end = candidate + size;
                match taken.iter().find(|(s, e)| *s < candidate_end && candidate < *e) {
                    None => {
                        return IpNetwork::new(from_u128(candidate, block.is_ipv4()), prefix).ok();
                    }
                    Some((_, busy_end)) => match align_up(*busy_end, size) {
                        Some(next) => candidate = next,
                        None => break,
                    },
                }
            }
        }
        None
    }
}

/// Named pools of CIDR blocks with per-owner allocation records
#[derive(Debug, Default)]
pub struct IpAllocator {
    pools: RwLock<HashMap<String, Pool>>,
}

impl IpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace the blocks of) a pool
    pub fn add_pool(&self, name: &str, blocks: Vec<IpNetwork>) {
        let blocks = blocks.into_iter().map(normalize).collect();
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools.entry(name.to_string()).or_default().blocks = blocks;
    }

    /// Allocate a CIDR for `owner`.
    ///
    /// Returns the existing allocation when the owner already holds one that
    /// satisfies the request, and `Conflict` when it holds a different one.
    pub fn allocate(&self, pool: &str, request: AllocationRequest, owner: &str) -> Result<IpNetwork, AllocatorError> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let p = pools
            .get_mut(pool)
            .ok_or_else(|| AllocatorError::UnknownPool(pool.to_string()))?;

        if let Some(existing) = p.records.get(owner) {
            if request.satisfied_by(&existing.cidr) {
                return Ok(existing.cidr);
            }
            return Err(AllocatorError::Conflict(format!(
                "owner {} already holds {} in pool '{}', which does not match the request",
                owner, existing.cidr, pool
            )));
        }

        let cidr = match request {
            AllocationRequest::Explicit(net) => {
                let net = normalize(net);
                if !p.contains(&net) {
                    return Err(AllocatorError::InvalidRequest(format!(
                        "{} is outside IP pool '{}'",
                        net, pool
                    )));
                }
                if let Some(other) = p.overlapping(&net) {
                    return Err(AllocatorError::Conflict(format!(
                        "{} overlaps {} already allocated to {}",
                        net, other.cidr, other.owner
                    )));
                }
                net
            }
            AllocationRequest::Size(size) => {
                if !size.is_power_of_two() {
                    return Err(AllocatorError::InvalidRequest(format!(
                        "allocation size {} is not a power of two",
                        size
                    )));
                }
                p.find_free(size).ok_or_else(|| AllocatorError::PoolExhausted {
                    pool: pool.to_string(),
                    size: u128::from(size),
                })?
            }
        };

        p.records.insert(
            owner.to_string(),
            Allocation {
                pool: pool.to_string(),
                cidr,
                owner: owner.to_string(),
            },
        );
        Ok(cidr)
    }

    /// Release whatever `owner` holds in `pool`; a no-op when nothing is held.
    ///
    /// Records are keyed by owner, so an allocation held by another owner is
    /// never touched.
    pub fn release(&self, pool: &str, owner: &str) -> Option<IpNetwork> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        pools
            .get_mut(pool)
            .and_then(|p| p.records.remove(owner))
            .map(|a| a.cidr)
    }

    /// Record an allocation discovered on the backend (startup rehydration)
    pub fn mark_allocated(&self, pool: &str, cidr: IpNetwork, owner: &str) -> Result<(), AllocatorError> {
        let cidr = normalize(cidr);
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let p = pools
            .get_mut(pool)
            .ok_or_else(|| AllocatorError::UnknownPool(pool.to_string()))?;

        if let Some(existing) = p.records.get(owner) {
            if existing.cidr == cidr {
                return Ok(());
            }
            return Err(AllocatorError::Conflict(format!(
                "owner {} already holds {} in pool '{}', backend reports {}",
                owner, existing.cidr, pool, cidr
            )));
        }
        if !p.contains(&cidr) {
            return Err(AllocatorError::InvalidRequest(format!(
                "{} is outside IP pool '{}'",
                cidr, pool
            )));
        }
        if let Some(other) = p.overlapping(&cidr) {
            return Err(AllocatorError::Conflict(format!(
                "{} overlaps {} already allocated to {}",
                cidr, other.cidr, other.owner
            )));
        }
        p.records.insert(
            owner.to_string(),
            Allocation {
                pool: pool.to_string(),
                cidr,
                owner: owner.to_string(),
            },
        );
        Ok(())
    }

    /// Allocation held by an owner in any pool
    pub fn allocation_of(&self, owner: &str) -> Option<Allocation> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools.values().find_map(|p| p.records.get(owner).cloned())
    }

    /// Allocated and total address counts of a pool
    pub fn usage(&self, pool: &str) -> Option<PoolUsage> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        let p = pools.get(pool)?;
        Some(PoolUsage {
            allocated: p.records.values().map(|r| cidr_len(&r.cidr)).sum(),
            capacity: p.blocks.iter().map(cidr_len).sum(),
        })
    }
}

/// Turn an `allocationSize` / explicit address pair into a request.
///
/// Setting both is accepted only when the explicit value is a single host.
pub fn validate_request(size: Option<u32>, explicit: Option<&str>) -> Result<AllocationRequest, AllocatorError> {
    match (size, explicit.map(str::trim).filter(|e| !e.is_empty())) {
        (None, None) => Err(AllocatorError::InvalidRequest(
            "one of allocationSize or allocationIPs must be set".to_string(),
        )),
        (Some(size), None) => {
            if size.is_power_of_two() {
                Ok(AllocationRequest::Size(size))
            } else {
                Err(AllocatorError::InvalidRequest(format!(
                    "allocationSize {} must be a power of two",
                    size
                )))
            }
        }
        (size, Some(explicit)) => {
            let net = parse_ip_or_cidr(explicit)?;
            if size.is_some() && !is_single_host(&net) {
                return Err(AllocatorError::InvalidRequest(format!(
                    "IPAddressAllocation must be a single IP when both allocationIPs and allocationSize are set, got {}",
                    explicit
                )));
            }
            Ok(AllocationRequest::Explicit(normalize(net)))
        }
    }
}

/// Parse a bare IP (as a host route) or a CIDR
pub fn parse_ip_or_cidr(value: &str) -> Result<IpNetwork, AllocatorError> {
    value
        .trim()
        .parse::<IpNetwork>()
        .map_err(|e| AllocatorError::InvalidRequest(format!("invalid IP or CIDR '{}': {}", value, e)))
}

/// True for a /32 (IPv4) or /128 (IPv6)
pub fn is_single_host(net: &IpNetwork) -> bool {
    u32::from(net.prefix()) == family_bits(net)
}

/// True if `candidate` (IP or CIDR) lies entirely inside `block`
pub fn cidr_contains(block: &str, candidate: &str) -> Result<bool, AllocatorError> {
    let block = parse_ip_or_cidr(block)?;
    let candidate = parse_ip_or_cidr(candidate)?;
    Ok(net_within(&block, &candidate))
}

/// Number of addresses in a CIDR
pub fn cidr_len(net: &IpNetwork) -> u128 {
    let (start, end) = span(net);
    end - start
}

fn normalize(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

fn family_bits(net: &IpNetwork) -> u32 {
    if net.is_ipv4() { 32 } else { 128 }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(value: u128, ipv4: bool) -> IpAddr {
    if ipv4 {
        IpAddr::V4(Ipv4Addr::from(u32::try_from(value).unwrap_or(u32::MAX)))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

// Half-open [start, end) range covered by a CIDR
fn span(net: &IpNetwork) -> (u128, u128) {
    let start = to_u128(net.network());
    let host_bits = family_bits(net) - u32::from(net.prefix());
    let len = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
    (start, start.saturating_add(len))
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    let (a_start, a_end) = span(a);
    let (b_start, b_end) = span(b);
    a_start < b_end && b_start < a_end
}

fn net_within(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    if outer.is_ipv4() != inner.is_ipv4() {
        return false;
    }
    let (o_start, o_end) = span(outer);
    let (i_start, i_end) = span(inner);
    o_start <= i_start && i_end <= o_end
}

fn align_up(value: u128, alignment: u128) -> Option<u128> {
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}
