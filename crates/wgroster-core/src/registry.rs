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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgroster_types::{Client, Document, SCHEMA_VERSION, Server};

use crate::alloc::{self, AllocationError};
use crate::keys::{KeyError, KeyProvider};

/// Routed ranges given to new clients: full tunnel.
pub const DEFAULT_ALLOWED_IPS: &[&str] = &["0.0.0.0/0", "::/0"];

pub fn default_allowed_ips() -> Vec<String> {
    DEFAULT_ALLOWED_IPS.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client name must not be empty")]
    EmptyName,

    #[error("client not found: {0}")]
    NotFound(String),

    #[error("no free address left in {0}")]
    AddressPoolExhausted(IpNetwork),

    #[error("invalid client address {address}: expected a single host")]
    InvalidAddress { address: String },

    #[error("address {address} is not a usable host in {subnet}")]
    AddressOutsideSubnet { address: IpAddr, subnet: IpNetwork },

    #[error("address {address} is already used by {holder}")]
    AddressInUse { address: IpAddr, holder: String },

    #[error(transparent)]
    Keys(#[from] KeyError),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server id must not be empty")]
    EmptyId,

    #[error("server name must not be empty")]
    EmptyName,

    #[error("server id already taken: {0}")]
    DuplicateId(String),

    #[error("server not found: {0}")]
    NotFound(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("port {0} out of range (1-65535)")]
    InvalidPort(u32),

    #[error("server stored under {key} carries id {id}")]
    MismatchedId { key: String, id: String },

    #[error("server {server}: client stored under {key} carries id {id}")]
    MismatchedClientId {
        server: String,
        key: String,
        id: String,
    },

    #[error("server {server}: address {address} is held by both {first} and {second}")]
    DuplicateClientAddress {
        server: String,
        address: IpAddr,
        first: String,
        second: String,
    },

    #[error("server address {address} is already used by client {client}")]
    AddressInUse { address: IpAddr, client: String },

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Keys(#[from] KeyError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything needed to create a server. Keys are generated.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u32,
    pub dns: Vec<String>,
    pub endpoint: String,
    pub preshared_key_policy: bool,
    pub persistent_keepalive: u16,
    pub public_interface: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u32>,
    pub dns: Option<Vec<String>>,
    pub endpoint: Option<String>,
    pub preshared_key_policy: Option<bool>,
    pub persistent_keepalive: Option<u16>,
    pub enabled: Option<bool>,
    pub public_interface: Option<Option<String>>,
}

/// Per-client deviations from the server defaults at creation time.
///
/// `preshared_key` overrides the server's policy in either direction.
#[derive(Debug, Clone, Default)]
pub struct ClientOverrides {
    pub dns: Option<Vec<String>>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Option<Vec<String>>,
    pub preshared_key: Option<bool>,
    pub enabled: Option<bool>,
}

/// Fields to change on an existing client. `None` leaves a field alone;
/// `preshared_key: Some(None)` clears the key.
#[derive(Debug, Clone, Default)]
pub struct ClientPatch {
    pub name: Option<String>,
    pub dns: Option<Vec<String>>,
    pub address: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub preshared_key: Option<Option<String>>,
}

fn parse_subnet(s: &str) -> Result<IpNetwork, ServerError> {
    s.trim()
        .parse()
        .map_err(|_| ServerError::InvalidSubnet(s.to_string()))
}

fn validate_port(port: u32) -> Result<u16, ServerError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ServerError::InvalidPort(port))
}

/// Client map keys must match client ids, and no two clients may share an
/// address.
fn check_clients(server: &Server) -> Result<(), ServerError> {
    let mut holders: HashMap<IpAddr, &str> = HashMap::new();
    for (key, client) in &server.clients {
        if *key != client.id {
            return Err(ServerError::MismatchedClientId {
                server: server.id.clone(),
                key: key.clone(),
                id: client.id.clone(),
            });
        }
        if let Some(first) = holders.insert(client.address.ip(), &client.id) {
            return Err(ServerError::DuplicateClientAddress {
                server: server.id.clone(),
                address: client.address.ip(),
                first: first.to_string(),
                second: client.id.clone(),
            });
        }
    }
    Ok(())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

// ---------------------------------------------------------------------------
// ServerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Server>,
    keys: Arc<dyn KeyProvider>,
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.servers)
            .finish_non_exhaustive()
    }
}

impl ServerRegistry {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            servers: BTreeMap::new(),
            keys,
        }
    }

    /// Build a registry from a loaded document, checking the invariants a
    /// hand-edited file could break. Clients outside their server's subnet
    /// are reported, not rejected.
    pub fn from_document(doc: Document, keys: Arc<dyn KeyProvider>) -> Result<Self, ServerError> {
        if doc.version != SCHEMA_VERSION {
            return Err(ServerError::UnsupportedVersion(doc.version));
        }

        for (key, server) in &doc.servers {
            if *key != server.id {
                return Err(ServerError::MismatchedId {
                    key: key.clone(),
                    id: server.id.clone(),
                });
            }
            validate_port(u32::from(server.port))?;
            check_clients(server)?;

            let stray = server.clients_outside_subnet();
            if !stray.is_empty() {
                warn!(
                    server_id = %server.id,
                    subnet = %server.address,
                    count = stray.len(),
                    "clients outside the server subnet"
                );
            }
        }

        debug!(server_count = doc.servers.len(), "registry loaded from document");
        Ok(Self {
            servers: doc.servers,
            keys,
        })
    }

    pub fn to_document(&self) -> Document {
        Document {
            version: SCHEMA_VERSION,
            servers: self.servers.clone(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    #[tracing::instrument(skip(self, new), fields(server_id = %new.id))]
    pub fn create_server(&mut self, new: NewServer) -> Result<Server, ServerError> {
        let id = non_empty(&new.id).ok_or(ServerError::EmptyId)?;
        if self.servers.contains_key(&id) {
            return Err(ServerError::DuplicateId(id));
        }
        let name = non_empty(&new.name).ok_or(ServerError::EmptyName)?;
        let address = parse_subnet(&new.address)?;
        let port = validate_port(new.port)?;

        let pair = self.keys.generate_key_pair()?;

        let server = Server {
            id: id.clone(),
            name,
            address,
            dns: new.dns,
            port,
            endpoint: new.endpoint.trim().to_string(),
            preshared_key_policy: new.preshared_key_policy,
            persistent_keepalive: new.persistent_keepalive,
            private_key: pair.private_key,
            public_key: pair.public_key,
            enabled: true,
            public_interface: new.public_interface.as_deref().and_then(non_empty),
            clients: BTreeMap::new(),
        };

        if server.endpoint.is_empty() {
            warn!("server has no endpoint, client configs will lack one");
        }

        self.servers.insert(id, server.clone());
        info!(address = %server.address, port = server.port, "created server");
        Ok(server)
    }

    #[tracing::instrument(skip(self, patch))]
    pub fn update_server(&mut self, id: &str, patch: ServerPatch) -> Result<Server, ServerError> {
        let current = self
            .servers
            .get(id)
            .ok_or_else(|| ServerError::NotFound(id.to_string()))?;
        let mut updated = current.clone();

        if let Some(name) = patch.name {
            updated.name = non_empty(&name).ok_or(ServerError::EmptyName)?;
        }
        if let Some(address) = patch.address {
            updated.address = parse_subnet(&address)?;
        }
        if let Some(port) = patch.port {
            updated.port = validate_port(port)?;
        }
        if let Some(dns) = patch.dns {
            updated.dns = dns;
        }
        if let Some(endpoint) = patch.endpoint {
            updated.endpoint = endpoint.trim().to_string();
        }
        if let Some(policy) = patch.preshared_key_policy {
            updated.preshared_key_policy = policy;
        }
        if let Some(keepalive) = patch.persistent_keepalive {
            updated.persistent_keepalive = keepalive;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(public_interface) = patch.public_interface {
            updated.public_interface = public_interface.as_deref().and_then(non_empty);
        }

        if updated.address != current.address {
            let host = updated.host();
            if let Some(holder) = updated.clients.values().find(|c| c.address.ip() == host) {
                return Err(ServerError::AddressInUse {
                    address: host,
                    client: holder.id.clone(),
                });
            }

            // Existing clients keep their addresses; moving them is the operator's call.
            let stray = updated.clients_outside_subnet();
            if !stray.is_empty() {
                warn!(
                    subnet = %updated.address,
                    count = stray.len(),
                    "address change leaves clients outside the new subnet"
                );
            }
        }

        self.servers.insert(id.to_string(), updated.clone());
        info!(enabled = updated.enabled, "updated server");
        Ok(updated)
    }

    /// Remove a server together with all of its clients.
    #[tracing::instrument(skip(self))]
    pub fn delete_server(&mut self, id: &str) -> Result<(), ServerError> {
        let removed = self
            .servers
            .remove(id)
            .ok_or_else(|| ServerError::NotFound(id.to_string()))?;
        info!(client_count = removed.clients.len(), "deleted server");
        Ok(())
    }

    /// A view over one server's clients. Changes made through the view land
    /// directly in this registry.
    pub fn client_registry(&mut self, id: &str) -> Result<ClientRegistry<'_>, ServerError> {
        let server = self
            .servers
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(id.to_string()))?;
        Ok(ClientRegistry {
            server,
            keys: self.keys.as_ref(),
        })
    }
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

pub struct ClientRegistry<'a> {
    server: &'a mut Server,
    keys: &'a dyn KeyProvider,
}

impl ClientRegistry<'_> {
    pub fn server(&self) -> &Server {
        &*self.server
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.server.clients.get(id)
    }

    /// All clients, ordered by address.
    pub fn list(&self) -> Vec<&Client> {
        let mut clients: Vec<&Client> = self.server.clients.values().collect();
        clients.sort_by_key(|c| c.address.ip());
        clients
    }

    /// Addresses that are taken: the server's own plus every client except
    /// `except`.
    fn reserved(&self, except: Option<&str>) -> HashSet<IpAddr> {
        let mut reserved: HashSet<IpAddr> = self
            .server
            .clients
            .values()
            .filter(|c| Some(c.id.as_str()) != except)
            .map(|c| c.address.ip())
            .collect();
        reserved.insert(self.server.host());
        reserved
    }

    fn validate_address(&self, client_id: &str, address: &str) -> Result<IpNetwork, ClientError> {
        let invalid = || ClientError::InvalidAddress {
            address: address.to_string(),
        };

        let ip = if address.contains('/') {
            let net: IpNetwork = address.trim().parse().map_err(|_| invalid())?;
            let host_prefix = if net.is_ipv4() { 32 } else { 128 };
            if net.prefix() != host_prefix {
                return Err(invalid());
            }
            net.ip()
        } else {
            alloc::parse_host(address).ok_or_else(invalid)?
        };

        if !alloc::is_usable_host(self.server.address, ip) {
            return Err(ClientError::AddressOutsideSubnet {
                address: ip,
                subnet: self.server.address,
            });
        }
        if ip == self.server.host() {
            return Err(ClientError::AddressInUse {
                address: ip,
                holder: format!("server {}", self.server.id),
            });
        }
        if let Some(holder) = self
            .server
            .clients
            .values()
            .find(|c| c.id != client_id && c.address.ip() == ip)
        {
            return Err(ClientError::AddressInUse {
                address: ip,
                holder: format!("client {}", holder.id),
            });
        }

        Ok(alloc::host_network(ip))
    }

    #[tracing::instrument(skip(self, overrides), fields(server_id = %self.server.id))]
    pub fn create(&mut self, name: &str, overrides: ClientOverrides) -> Result<Client, ClientError> {
        let name = non_empty(name).ok_or(ClientError::EmptyName)?;

        let address = alloc::allocate_host(self.server.address, &self.reserved(None)).map_err(
            |e| match e {
                AllocationError::PoolExhausted(subnet) => ClientError::AddressPoolExhausted(subnet),
                other => ClientError::InvalidAddress {
                    address: other.to_string(),
                },
            },
        )?;

        let pair = self.keys.generate_key_pair()?;
        let wants_psk = overrides
            .preshared_key
            .unwrap_or(self.server.preshared_key_policy);
        let preshared_key = if wants_psk {
            Some(self.keys.generate_preshared_key()?)
        } else {
            None
        };

        let now = Utc::now();
        let client = Client {
            id: Uuid::new_v4().to_string(),
            name,
            address,
            private_key: pair.private_key,
            public_key: pair.public_key,
            preshared_key,
            dns: overrides.dns.unwrap_or_else(|| self.server.dns.clone()),
            persistent_keepalive: overrides
                .persistent_keepalive
                .unwrap_or(self.server.persistent_keepalive),
            allowed_ips: overrides.allowed_ips.unwrap_or_else(default_allowed_ips),
            enabled: overrides.enabled.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };

        self.server
            .clients
            .insert(client.id.clone(), client.clone());
        info!(
            client_id = %client.id,
            address = %client.address,
            psk = client.preshared_key.is_some(),
            "created client"
        );
        Ok(client)
    }

    /// Apply `patch`. A patch that changes nothing keeps `updated_at`.
    #[tracing::instrument(skip(self, patch), fields(server_id = %self.server.id))]
    pub fn update(&mut self, client_id: &str, patch: ClientPatch) -> Result<Client, ClientError> {
        let current = self
            .server
            .clients
            .get(client_id)
            .ok_or_else(|| ClientError::NotFound(client_id.to_string()))?;
        let mut updated = current.clone();

        if let Some(name) = patch.name {
            updated.name = non_empty(&name).ok_or(ClientError::EmptyName)?;
        }
        if let Some(address) = patch.address {
            updated.address = self.validate_address(client_id, &address)?;
        }
        if let Some(dns) = patch.dns {
            updated.dns = dns;
        }
        if let Some(keepalive) = patch.persistent_keepalive {
            updated.persistent_keepalive = keepalive;
        }
        if let Some(allowed_ips) = patch.allowed_ips {
            updated.allowed_ips = allowed_ips;
        }
        if let Some(enabled) = patch.enabled {
            updated.enabled = enabled;
        }
        if let Some(psk) = patch.preshared_key {
            updated.preshared_key = psk.as_deref().and_then(non_empty);
        }

        if updated == *current {
            debug!(client_id, "patch changes nothing");
            return Ok(updated);
        }

        updated.updated_at = Utc::now();
        self.server
            .clients
            .insert(client_id.to_string(), updated.clone());
        info!(client_id, address = %updated.address, enabled = updated.enabled, "updated client");
        Ok(updated)
    }

    #[tracing::instrument(skip(self), fields(server_id = %self.server.id))]
    pub fn delete(&mut self, client_id: &str) -> Result<(), ClientError> {
        let removed = self
            .server
            .clients
            .remove(client_id)
            .ok_or_else(|| ClientError::NotFound(client_id.to_string()))?;
        info!(address = %removed.address, "deleted client");
        Ok(())
    }

    /// Replace the client's key pair, and its pre-shared key if it has one.
    #[tracing::instrument(skip(self), fields(server_id = %self.server.id))]
    pub fn rotate_keys(&mut self, client_id: &str) -> Result<Client, ClientError> {
        let mut updated = self
            .server
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(client_id.to_string()))?;

        let pair = self.keys.generate_key_pair()?;
        if updated.preshared_key.is_some() {
            updated.preshared_key = Some(self.keys.generate_preshared_key()?);
        }
        updated.private_key = pair.private_key;
        updated.public_key = pair.public_key;
        updated.updated_at = Utc::now();

        self.server
            .clients
            .insert(client_id.to_string(), updated.clone());
        info!("rotated client keys");
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
