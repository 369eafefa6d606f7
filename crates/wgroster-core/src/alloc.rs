// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Host address allocation inside a server subnet.
//!
//! Allocation is lowest-free-first: candidates are walked in ascending order
//! and the first one that is neither the server's own address nor already
//! assigned wins. Freed addresses are therefore handed out again before any
//! higher address.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid server address: {0}")]
    InvalidServerAddress(String),

    #[error("invalid used address: {0}")]
    InvalidUsedAddress(String),

    #[error("no free host address left in {0}")]
    PoolExhausted(IpNetwork),
}

/// Result of [`allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The allocated host with a `/32` or `/128` mask.
    pub address: IpNetwork,
    /// Used-address entries that could not be parsed for the subnet's family.
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// CIDR math helpers
// ---------------------------------------------------------------------------

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(n: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(n as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(n))
    }
}

/// Inclusive numeric bounds of the usable hosts in `network`.
///
/// IPv4 drops the network and broadcast addresses up to /30; /31 and /32 use
/// every address. IPv6 drops only the subnet-router anycast address up to
/// /126.
fn host_bounds(network: IpNetwork) -> (u128, u128) {
    let prefix = network.prefix();
    let (bits, base) = match network {
        IpNetwork::V4(n) => (32u8, u128::from(u32::from(n.network()))),
        IpNetwork::V6(n) => (128u8, u128::from(n.network())),
    };
    let host_bits = u32::from(bits - prefix);
    let span = u128::MAX.checked_shr(128 - host_bits).unwrap_or(0);
    let last = base + span;

    match network {
        IpNetwork::V4(_) if prefix <= 30 => (base + 1, last - 1),
        IpNetwork::V6(_) if prefix <= 126 => (base + 1, last),
        _ => (base, last),
    }
}

/// Whether `ip` is a host that could be assigned to a peer in `network`.
pub fn is_usable_host(network: IpNetwork, ip: IpAddr) -> bool {
    if network.is_ipv4() != ip.is_ipv4() || !network.contains(ip) {
        return false;
    }
    let (first, last) = host_bounds(network);
    let n = ip_to_u128(ip);
    first <= n && n <= last
}

/// Wrap a bare address in a host mask (`/32` or `/128`).
pub fn host_network(ip: IpAddr) -> IpNetwork {
    IpNetwork::from(ip)
}

/// Parse `a.b.c.d` or `a.b.c.d/nn` (or the IPv6 equivalents) into the
/// address part.
pub fn parse_host(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    if s.contains('/') {
        s.parse::<IpNetwork>().ok().map(|n| n.ip())
    } else {
        s.parse::<IpAddr>().ok()
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Lowest usable host in `network` that is not in `reserved`.
pub fn next_free(network: IpNetwork, reserved: &HashSet<IpAddr>) -> Option<IpAddr> {
    let (first, last) = host_bounds(network);
    let v4 = network.is_ipv4();

    let mut candidate = first;
    loop {
        let ip = u128_to_ip(candidate, v4);
        if !reserved.contains(&ip) {
            return Some(ip);
        }
        if candidate == last {
            return None;
        }
        candidate += 1;
    }
}

/// Allocate the next free host in `subnet`, skipping malformed used entries.
///
/// This is the entry point for callers holding raw strings, such as address
/// lists read from other tools. Typed callers use [`allocate_host`].
///
/// `server_address` is always reserved, with or without a prefix. Used
/// entries outside the subnet are ignored; entries that do not parse for
/// the subnet's address family are skipped and returned in
/// [`Allocation::skipped`].
pub fn allocate<I, S>(
    subnet: &str,
    server_address: &str,
    used_addresses: I,
) -> Result<Allocation, AllocationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    allocate_inner(subnet, server_address, used_addresses, false)
}

/// Like [`allocate`], but a malformed used entry fails the whole allocation
/// with [`AllocationError::InvalidUsedAddress`].
pub fn allocate_strict<I, S>(
    subnet: &str,
    server_address: &str,
    used_addresses: I,
) -> Result<Allocation, AllocationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    allocate_inner(subnet, server_address, used_addresses, true)
}

fn allocate_inner<I, S>(
    subnet: &str,
    server_address: &str,
    used_addresses: I,
    strict: bool,
) -> Result<Allocation, AllocationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let network: IpNetwork = subnet
        .trim()
        .parse()
        .map_err(|_| AllocationError::InvalidSubnet(subnet.to_string()))?;

    let server_ip = parse_host(server_address)
        .filter(|ip| ip.is_ipv4() == network.is_ipv4())
        .ok_or_else(|| AllocationError::InvalidServerAddress(server_address.to_string()))?;

    let mut reserved = HashSet::new();
    reserved.insert(server_ip);

    let mut skipped = Vec::new();
    for entry in used_addresses {
        let entry = entry.as_ref();
        match parse_host(entry).filter(|ip| ip.is_ipv4() == network.is_ipv4()) {
            Some(ip) => {
                reserved.insert(ip);
            }
            None if strict => {
                return Err(AllocationError::InvalidUsedAddress(entry.to_string()));
            }
            None => {
                warn!(entry, %network, "skipping malformed used address");
                skipped.push(entry.to_string());
            }
        }
    }

    let address = allocate_host(network, &reserved)?;
    if !skipped.is_empty() {
        debug!(%network, skipped = skipped.len(), "allocated despite malformed entries");
    }

    Ok(Allocation { address, skipped })
}

/// Typed core of [`allocate`]: the next free host of `network` as a `/32`
/// or `/128`, given the addresses already taken (server included).
pub fn allocate_host(
    network: IpNetwork,
    reserved: &HashSet<IpAddr>,
) -> Result<IpNetwork, AllocationError> {
    let ip = next_free(network, reserved).ok_or(AllocationError::PoolExhausted(network))?;
    let address = host_network(ip);
    debug!(%network, %address, reserved = reserved.len(), "allocated host address");
    Ok(address)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
