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

//! One-time upgrade of legacy documents to the current schema.
//!
//! Older tools wrote placeholder strings instead of keys when the `wg`
//! binary was missing. Those, and empty keys, are regenerated here; every
//! other malformed value aborts the migration with the offending field.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde_json::Value;
use tracing::{info, warn};
use wgroster_types::legacy::{
    LegacyClient, LegacyServer, LooseBool, LooseNumber, MultiServerDocument, SingleServerDocument,
};
use wgroster_types::{Client, Document, SCHEMA_VERSION, Server};

use crate::alloc;
use crate::keys::{KeyError, KeyPair, KeyProvider};
use crate::registry::default_allowed_ips;
use crate::store::{JsonFileStore, LegacySchema, RecordStore, Schema, StoreError, detect_schema};

const DEFAULT_PORT: u16 = 51820;

const PLACEHOLDER_VALUES: &[&str] = &["no_wg", "error"];

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("nothing to migrate: {0}")]
    NothingToMigrate(&'static str),

    #[error("failed to read legacy document: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("server {server}: missing {field}")]
    MissingField { server: String, field: &'static str },

    #[error("server {server}: invalid {field} {value:?}")]
    InvalidField {
        server: String,
        field: &'static str,
        value: String,
    },

    #[error("server {server}, client {client}: invalid {field} {value:?}")]
    InvalidClientField {
        server: String,
        client: String,
        field: &'static str,
        value: String,
    },

    #[error(transparent)]
    Keys(#[from] KeyError),
}

/// What [`migrate_file`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub schema: LegacySchema,
    pub servers: usize,
    pub clients: usize,
    pub regenerated_keys: usize,
    pub backup: PathBuf,
}

/// Upgrade a legacy document in place: back it up to `<path>.bak`, convert,
/// and save in the current schema. `single_server_id` names the server of a
/// single-server document.
#[tracing::instrument(skip(store, keys), fields(path = %store.path().display()))]
pub fn migrate_file(
    store: &JsonFileStore,
    single_server_id: &str,
    keys: &dyn KeyProvider,
) -> Result<MigrationReport, MigrateError> {
    let value = store
        .read_raw()?
        .ok_or(MigrateError::NothingToMigrate("document does not exist"))?;

    let mut upgrade = Upgrade::new(keys);
    let (doc, schema) = upgrade.run(value, single_server_id)?;

    let backup = store.backup()?;
    store.save(&doc)?;

    let report = MigrationReport {
        schema,
        servers: doc.servers.len(),
        clients: doc.servers.values().map(|s| s.clients.len()).sum(),
        regenerated_keys: upgrade.regenerated,
        backup,
    };
    info!(
        %schema,
        servers = report.servers,
        clients = report.clients,
        regenerated_keys = report.regenerated_keys,
        "migrated document"
    );
    Ok(report)
}

/// Convert a legacy JSON value without touching any file.
pub fn upgrade(
    value: Value,
    single_server_id: &str,
    keys: &dyn KeyProvider,
) -> Result<(Document, LegacySchema), MigrateError> {
    Upgrade::new(keys).run(value, single_server_id)
}

struct Upgrade<'a> {
    keys: &'a dyn KeyProvider,
    now: DateTime<Utc>,
    regenerated: usize,
}

fn is_placeholder(s: &str) -> bool {
    let s = s.trim();
    s.is_empty() || s.starts_with("PLACEHOLDER_") || PLACEHOLDER_VALUES.contains(&s)
}

fn real_value(s: Option<String>) -> Option<String> {
    s.filter(|s| !is_placeholder(s)).map(|s| s.trim().to_string())
}

impl<'a> Upgrade<'a> {
    fn new(keys: &'a dyn KeyProvider) -> Self {
        Self {
            keys,
            now: Utc::now(),
            regenerated: 0,
        }
    }

    fn run(
        &mut self,
        value: Value,
        single_server_id: &str,
    ) -> Result<(Document, LegacySchema), MigrateError> {
        let schema = match detect_schema(&value)? {
            Schema::Current => {
                return Err(MigrateError::NothingToMigrate("already at the current schema"));
            }
            Schema::Legacy(schema) => schema,
        };

        let legacy_servers = match schema {
            LegacySchema::SingleServer => {
                let doc: SingleServerDocument =
                    serde_json::from_value(value).map_err(MigrateError::Parse)?;
                let mut server = doc.server;
                server.clients.extend(doc.clients);
                BTreeMap::from([(single_server_id.to_string(), server)])
            }
            LegacySchema::UnversionedMulti => {
                let doc: MultiServerDocument =
                    serde_json::from_value(value).map_err(MigrateError::Parse)?;
                doc.servers
            }
        };

        let mut servers = BTreeMap::new();
        for (id, legacy) in legacy_servers {
            let server = self.server(&id, legacy)?;
            servers.insert(id, server);
        }

        Ok((
            Document {
                version: SCHEMA_VERSION,
                servers,
            },
            schema,
        ))
    }

    fn key_pair(
        &mut self,
        private_key: Option<String>,
        public_key: Option<String>,
    ) -> Result<KeyPair, KeyError> {
        match (real_value(private_key), real_value(public_key)) {
            (Some(private_key), Some(public_key)) => Ok(KeyPair {
                private_key,
                public_key,
            }),
            _ => {
                self.regenerated += 1;
                self.keys.generate_key_pair()
            }
        }
    }

    fn server(&mut self, id: &str, legacy: LegacyServer) -> Result<Server, MigrateError> {
        let invalid = |field: &'static str, value: String| MigrateError::InvalidField {
            server: id.to_string(),
            field,
            value,
        };

        let raw_address = legacy.address.ok_or_else(|| MigrateError::MissingField {
            server: id.to_string(),
            field: "address",
        })?;
        let address: IpNetwork = raw_address
            .trim()
            .parse()
            .map_err(|_| invalid("address", raw_address.clone()))?;

        let port = match legacy.port {
            None => DEFAULT_PORT,
            Some(port) => number_in_range(&port, 1)
                .ok_or_else(|| invalid("port", loose_number_text(&port)))?,
        };

        let persistent_keepalive = match legacy.persistent_keepalive {
            None => 0,
            Some(keepalive) => number_in_range(&keepalive, 0)
                .ok_or_else(|| invalid("persistentKeepalive", loose_number_text(&keepalive)))?,
        };

        let preshared_key_policy = loose_bool(legacy.preshared_key_policy, false)
            .map_err(|v| invalid("presharedKey", v))?;
        let enabled = loose_bool(legacy.enabled, true).map_err(|v| invalid("enabled", v))?;

        let pair = self.key_pair(legacy.private_key, legacy.public_key)?;
        if pair.public_key.is_empty() {
            return Err(invalid("publicKey", String::new()));
        }

        let endpoint = legacy.endpoint.unwrap_or_default().trim().to_string();
        if endpoint.is_empty() {
            warn!(server_id = id, "legacy server has no endpoint");
        }

        let mut server = Server {
            id: id.to_string(),
            name: legacy
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| id.to_string()),
            address,
            dns: legacy.dns.map(|d| d.into_vec()).unwrap_or_default(),
            port,
            endpoint,
            preshared_key_policy,
            persistent_keepalive,
            private_key: pair.private_key,
            public_key: pair.public_key,
            enabled,
            public_interface: real_value(legacy.interface),
            clients: BTreeMap::new(),
        };

        for (client_id, legacy_client) in legacy.clients {
            let client = self.client(&server, &client_id, legacy_client)?;
            server.clients.insert(client_id, client);
        }

        let stray = server.clients_outside_subnet().len();
        if stray > 0 {
            warn!(server_id = id, count = stray, "migrated clients outside the server subnet");
        }

        Ok(server)
    }

    fn client(
        &mut self,
        server: &Server,
        id: &str,
        legacy: LegacyClient,
    ) -> Result<Client, MigrateError> {
        let invalid = |field: &'static str, value: String| MigrateError::InvalidClientField {
            server: server.id.clone(),
            client: id.to_string(),
            field,
            value,
        };

        let name = legacy
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("name", String::new()))?;

        // List-valued addresses keep their first entry.
        let raw_address = legacy
            .address
            .and_then(|a| a.into_vec().into_iter().next())
            .ok_or_else(|| invalid("address", String::new()))?;
        let address = alloc::parse_host(&raw_address)
            .map(alloc::host_network)
            .ok_or_else(|| invalid("address", raw_address.clone()))?;

        let persistent_keepalive = match legacy.persistent_keepalive {
            None => server.persistent_keepalive,
            Some(keepalive) => number_in_range(&keepalive, 0)
                .ok_or_else(|| invalid("persistentKeepalive", loose_number_text(&keepalive)))?,
        };

        let enabled = loose_bool(legacy.enabled, false).map_err(|v| invalid("enabled", v))?;

        let created_at = timestamp(legacy.created_at.as_deref()).unwrap_or(self.now);
        let updated_at = timestamp(legacy.updated_at.as_deref()).unwrap_or(created_at);

        let pair = self.key_pair(legacy.private_key, legacy.public_key)?;

        Ok(Client {
            id: id.to_string(),
            name,
            address,
            private_key: pair.private_key,
            public_key: pair.public_key,
            preshared_key: real_value(legacy.preshared_key),
            dns: legacy.dns.map(|d| d.into_vec()).unwrap_or_default(),
            persistent_keepalive,
            allowed_ips: legacy
                .allowed_ips
                .map(|a| a.into_vec())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(default_allowed_ips),
            enabled,
            created_at,
            updated_at,
        })
    }
}

fn number_in_range(n: &LooseNumber, min: i64) -> Option<u16> {
    n.value()
        .filter(|v| *v >= min)
        .and_then(|v| u16::try_from(v).ok())
}

fn loose_number_text(n: &LooseNumber) -> String {
    match n {
        LooseNumber::Number(v) => v.to_string(),
        LooseNumber::Text(s) => s.clone(),
    }
}

fn loose_bool(b: Option<LooseBool>, default: bool) -> Result<bool, String> {
    match b {
        None => Ok(default),
        Some(b) => b.value().ok_or_else(|| format!("{b:?}")),
    }
}

fn timestamp(s: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s?.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequentialKeys;
    use serde_json::json;

    fn single_server_fixture() -> Value {
        json!({
            "server": {
                "privateKey": "spriv", "publicKey": "spub",
                "address": "10.10.10.1/24", "dns": "1.1.1.1", "port": 51820,
                "PresharedKey": "True", "endpoint": "vpn.example.com",
                "persistentKeepalive": 0, "interface": "eth0"
            },
            "clients": {
                "c1": {
                    "id": "c1", "name": "laptop", "address": ["10.10.10.2/32", "fd00::2/128"],
                    "privateKey": "cpriv", "publicKey": "cpub", "presharedKey": null,
                    "createdAt": "2024-05-01T10:00:00.000Z", "updatedAt": "2024-05-02T10:00:00.000Z",
                    "endpoint": "", "dns": "", "persistentKeepalive": "25",
                    "allowedIPs": "0.0.0.0/0, ::/0", "enabled": true
                },
                "c2": {
                    "name": "phone", "address": "10.10.10.3/32",
                    "privateKey": "PLACEHOLDER_PRIVATE_KEY_wg_not_found",
                    "publicKey": "PLACEHOLDER_PUBLIC_KEY_wg_not_found",
                    "PresharedKey": "no_wg"
                }
            }
        })
    }

    #[test]
    fn upgrades_single_server_document() {
        let keys = SequentialKeys::new();
        let (doc, schema) = upgrade(single_server_fixture(), "wg0", &keys).unwrap();
        assert_eq!(schema, LegacySchema::SingleServer);
        assert_eq!(doc.version, SCHEMA_VERSION);

        let server = &doc.servers["wg0"];
        assert_eq!(server.name, "wg0");
        assert_eq!(server.address.to_string(), "10.10.10.1/24");
        assert_eq!(server.dns, vec!["1.1.1.1"]);
        assert!(server.preshared_key_policy);
        assert_eq!(server.public_interface.as_deref(), Some("eth0"));
        assert_eq!(server.private_key, "spriv");

        let laptop = &server.clients["c1"];
        assert_eq!(laptop.address.to_string(), "10.10.10.2/32");
        assert_eq!(laptop.persistent_keepalive, 25);
        assert_eq!(laptop.allowed_ips, vec!["0.0.0.0/0", "::/0"]);
        assert!(laptop.dns.is_empty());
        assert!(laptop.enabled);
        assert!(laptop.updated_at > laptop.created_at);

        let phone = &server.clients["c2"];
        assert!(!phone.private_key.starts_with("PLACEHOLDER"));
        assert!(phone.preshared_key.is_none());
        assert!(!phone.enabled, "missing enabled flag meant disabled");
        assert_eq!(phone.persistent_keepalive, 0);
    }

    #[test]
    fn upgrades_unversioned_multi_document() {
        let value = json!({
            "servers": {
                "office": {
                    "name": "Office", "privateKey": "", "publicKey": "",
                    "address": "10.0.10.1/24", "port": "51821", "dns": "1.1.1.1, 9.9.9.9",
                    "enable": false, "endpoint": "office.example.com",
                    "clients": {
                        "a": { "name": "a", "address": "10.0.10.2/32", "privateKey": "x", "publicKey": "y", "enabled": true }
                    }
                }
            }
        });
        let keys = SequentialKeys::new();
        let (doc, schema) = upgrade(value, "unused", &keys).unwrap();
        assert_eq!(schema, LegacySchema::UnversionedMulti);

        let server = &doc.servers["office"];
        assert_eq!(server.port, 51821);
        assert_eq!(server.dns, vec!["1.1.1.1", "9.9.9.9"]);
        assert!(!server.enabled);
        assert!(!server.private_key.is_empty());
        assert_eq!(server.clients.len(), 1);
    }

    #[test]
    fn rejects_current_document() {
        let err = upgrade(json!({"version": 2, "servers": {}}), "wg0", &SequentialKeys::new())
            .unwrap_err();
        assert!(matches!(err, MigrateError::NothingToMigrate(_)));
    }

    #[test]
    fn rejects_bad_server_port() {
        let value = json!({"servers": {"s": {"address": "10.0.0.1/24", "port": "99999"}}});
        let err = upgrade(value, "wg0", &SequentialKeys::new()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidField { field: "port", .. }));
    }

    #[test]
    fn rejects_bad_client_address() {
        let value = json!({
            "server": {"address": "10.0.0.1/24", "privateKey": "a", "publicKey": "b"},
            "clients": {"c": {"name": "c", "address": "ten.zero"}}
        });
        let err = upgrade(value, "wg0", &SequentialKeys::new()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidClientField { field: "address", .. }));
    }

    #[test]
    fn missing_server_address() {
        let value = json!({"server": {"privateKey": "a"}, "clients": {}});
        let err = upgrade(value, "wg0", &SequentialKeys::new()).unwrap_err();
        assert!(matches!(err, MigrateError::MissingField { field: "address", .. }));
    }

    #[test]
    fn migrate_file_writes_backup_and_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.json");
        std::fs::write(&path, single_server_fixture().to_string()).unwrap();
        let store = JsonFileStore::new(&path);

        let report = migrate_file(&store, "wg0", &SequentialKeys::new()).unwrap();
        assert_eq!(report.servers, 1);
        assert_eq!(report.clients, 2);
        assert_eq!(report.regenerated_keys, 1);
        assert!(report.backup.exists());

        let doc = store.load().unwrap();
        assert_eq!(doc.servers["wg0"].clients.len(), 2);

        let again = migrate_file(&store, "wg0", &SequentialKeys::new()).unwrap_err();
        assert!(matches!(again, MigrateError::NothingToMigrate(_)));
    }
}
