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

//! wgroster-types: the persisted document model for wgroster.
//!
//! This crate contains the server/client records as they are stored on disk,
//! plus the loose shapes written by older releases (see [`legacy`]).

#![warn(missing_docs)]

pub mod legacy;

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Schema version written into every document produced by this release.
pub const SCHEMA_VERSION: u32 = 2;

fn enabled_by_default() -> bool {
    true
}

/// The top-level persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Schema version, always [`SCHEMA_VERSION`] when written.
    pub version: u32,
    /// Servers keyed by their id.
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            servers: BTreeMap::new(),
        }
    }
}

/// A WireGuard server interface and the clients that connect through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name for this server.
    pub name: String,
    /// Interface address with the subnet prefix, e.g. `10.10.10.1/24`.
    pub address: IpNetwork,
    /// DNS resolvers handed to new clients.
    #[serde(default)]
    pub dns: Vec<String>,
    /// UDP listen port.
    pub port: u16,
    /// Public host or IP clients use to reach this server.
    pub endpoint: String,
    /// Whether new clients get a generated pre-shared key.
    #[serde(default)]
    pub preshared_key_policy: bool,
    /// Keepalive interval in seconds handed to new clients, 0 disables it.
    #[serde(default)]
    pub persistent_keepalive: u16,
    /// WireGuard private key (base64).
    pub private_key: String,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Disabled servers stay in the document but are not meant to be brought up.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Uplink interface used for the NAT rules in the generated config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_interface: Option<String>,
    /// Clients keyed by their id.
    #[serde(default)]
    pub clients: BTreeMap<String, Client>,
}

impl Server {
    /// The server's own interface address, without the prefix.
    pub fn host(&self) -> IpAddr {
        self.address.ip()
    }

    /// Enabled clients ordered by address. These are the peers of the
    /// server's interface.
    pub fn enabled_clients(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.clients.values().filter(|c| c.enabled).collect();
        clients.sort_by_key(|c| c.address.ip());
        clients
    }

    /// Clients whose address no longer falls inside this server's subnet.
    pub fn clients_outside_subnet(&self) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| !self.address.contains(c.address.ip()))
            .collect()
    }
}

/// A WireGuard client peer owned by exactly one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Identifier, unique within the owning server.
    pub id: String,
    /// Human-readable name (e.g. "Dad's laptop").
    pub name: String,
    /// Assigned host address with a host mask, e.g. `10.10.10.2/32`.
    pub address: IpNetwork,
    /// WireGuard private key (base64).
    pub private_key: String,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Optional pre-shared key (base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// DNS resolvers for the client's interface.
    #[serde(default)]
    pub dns: Vec<String>,
    /// Keepalive interval in seconds, 0 disables it.
    #[serde(default)]
    pub persistent_keepalive: u16,
    /// Destination ranges routed through the tunnel on the client side.
    #[serde(rename = "allowedIPs", default)]
    pub allowed_ips: Vec<String>,
    /// Disabled clients are left out of the server's peer list.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// When this client was created.
    pub created_at: DateTime<Utc>,
    /// When this client was last changed.
    pub updated_at: DateTime<Utc>,
}
