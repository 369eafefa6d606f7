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

//! Document shapes written before schema version 2.
//!
//! These are only ever read, never written. Field types are deliberately
//! loose: older tools stored ports as strings, booleans as `"True"`, and
//! addresses as either a string or a list.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A value stored either as a single string or as a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LooseList {
    /// A list of values.
    Many(Vec<String>),
    /// A single string, possibly comma separated.
    One(String),
}

impl LooseList {
    /// Flatten into trimmed, non-empty entries, splitting strings on commas.
    pub fn into_vec(self) -> Vec<String> {
        let items = match self {
            Self::Many(items) => items,
            Self::One(s) => vec![s],
        };
        items
            .iter()
            .flat_map(|s| s.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// A number stored either natively or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    /// A JSON number.
    Number(i64),
    /// A numeric string such as `"25"`.
    Text(String),
}

impl LooseNumber {
    /// The numeric value, or `None` if the string form does not parse.
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// A boolean stored either natively or as a string like `"True"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LooseBool {
    /// A JSON boolean.
    Bool(bool),
    /// A string form.
    Text(String),
}

impl LooseBool {
    /// The boolean value, or `None` if the string form is not recognised.
    pub fn value(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" | "" => Some(false),
                _ => None,
            },
        }
    }
}

/// `{ "server": {...}, "clients": {...} }`, the first single-server layout.
#[derive(Debug, Clone, Deserialize)]
pub struct SingleServerDocument {
    /// The one server.
    pub server: LegacyServer,
    /// Clients of that server, keyed by id.
    #[serde(default)]
    pub clients: BTreeMap<String, LegacyClient>,
}

/// `{ "servers": {...} }` without a `version` key.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiServerDocument {
    /// Servers keyed by id, each carrying its own clients.
    #[serde(default)]
    pub servers: BTreeMap<String, LegacyServer>,
}

/// A server record as written by older tools.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyServer {
    /// Display name.
    pub name: Option<String>,
    /// Interface address with prefix.
    pub address: Option<String>,
    /// DNS resolvers.
    pub dns: Option<LooseList>,
    /// Listen port.
    pub port: Option<LooseNumber>,
    /// Public endpoint.
    pub endpoint: Option<String>,
    /// Pre-shared key policy.
    #[serde(alias = "PresharedKey", alias = "presharedKey")]
    pub preshared_key_policy: Option<LooseBool>,
    /// Keepalive seconds.
    pub persistent_keepalive: Option<LooseNumber>,
    /// Private key.
    pub private_key: Option<String>,
    /// Public key.
    pub public_key: Option<String>,
    /// Enabled flag, spelled `enable` by some writers.
    #[serde(alias = "enable")]
    pub enabled: Option<LooseBool>,
    /// Uplink interface name.
    pub interface: Option<String>,
    /// Clients, when the server carries them itself.
    #[serde(default)]
    pub clients: BTreeMap<String, LegacyClient>,
}

/// A client record as written by older tools.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyClient {
    /// Id, normally repeated from the map key.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Address, either a string or a list of strings.
    pub address: Option<LooseList>,
    /// Private key.
    pub private_key: Option<String>,
    /// Public key.
    pub public_key: Option<String>,
    /// Pre-shared key.
    #[serde(alias = "PresharedKey")]
    pub preshared_key: Option<String>,
    /// DNS resolvers.
    pub dns: Option<LooseList>,
    /// Keepalive seconds.
    pub persistent_keepalive: Option<LooseNumber>,
    /// Routed ranges.
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Option<LooseList>,
    /// Enabled flag.
    pub enabled: Option<LooseBool>,
    /// RFC 3339 creation timestamp.
    pub created_at: Option<String>,
    /// RFC 3339 update timestamp.
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(r#""1.1.1.1""#, &["1.1.1.1"] ; "single string")]
    #[test_case(r#""1.1.1.1, 8.8.8.8""#, &["1.1.1.1", "8.8.8.8"] ; "comma string")]
    #[test_case(r#"["10.0.0.2/32", "fd00::2/128"]"#, &["10.0.0.2/32", "fd00::2/128"] ; "list")]
    #[test_case(r#""""#, &[] ; "empty string")]
    fn loose_list(json: &str, expected: &[&str]) {
        let parsed: LooseList = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.into_vec(), expected);
    }

    #[test_case("25", Some(25) ; "number")]
    #[test_case(r#""25""#, Some(25) ; "numeric string")]
    #[test_case(r#""abc""#, None ; "garbage")]
    fn loose_number(json: &str, expected: Option<i64>) {
        let parsed: LooseNumber = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.value(), expected);
    }

    #[test_case("true", Some(true) ; "bool")]
    #[test_case(r#""True""#, Some(true) ; "python string")]
    #[test_case(r#""False""#, Some(false) ; "python false")]
    #[test_case(r#""maybe""#, None ; "garbage")]
    fn loose_bool(json: &str, expected: Option<bool>) {
        let parsed: LooseBool = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.value(), expected);
    }

    #[test]
    fn parse_single_server_document() {
        let json = r#"{
            "server": {
                "privateKey": "spriv", "publicKey": "spub",
                "address": "10.10.10.1/24", "dns": "1.1.1.1", "port": 51820,
                "PresharedKey": "True", "endpoint": "vpn.example.com",
                "persistentKeepalive": 0, "interface": "eth0"
            },
            "clients": {
                "c1": {
                    "id": "c1", "name": "laptop", "address": ["10.10.10.2/32"],
                    "privateKey": "cpriv", "publicKey": "cpub", "presharedKey": null,
                    "createdAt": "2024-05-01T10:00:00.000Z", "updatedAt": "2024-05-01T10:00:00.000Z",
                    "endpoint": "", "dns": "", "persistentKeepalive": "25",
                    "allowedIPs": "0.0.0.0/0, ::/0", "enabled": true
                }
            }
        }"#;
        let doc: SingleServerDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.server.preshared_key_policy.unwrap().value(), Some(true));
        assert_eq!(doc.server.interface.as_deref(), Some("eth0"));
        let client = &doc.clients["c1"];
        assert_eq!(client.persistent_keepalive.as_ref().unwrap().value(), Some(25));
        assert_eq!(
            client.allowed_ips.clone().unwrap().into_vec(),
            vec!["0.0.0.0/0", "::/0"]
        );
        assert!(client.preshared_key.is_none());
    }

    #[test]
    fn parse_multi_server_document() {
        let json = r#"{
            "servers": {
                "office": {
                    "name": "office", "privateKey": "a", "publicKey": "b",
                    "address": "10.0.10.1/24", "port": "51821", "dns": "1.1.1.1",
                    "enable": false, "endpoint": "office.example.com"
                }
            }
        }"#;
        let doc: MultiServerDocument = serde_json::from_str(json).unwrap();
        let server = &doc.servers["office"];
        assert_eq!(server.port.as_ref().unwrap().value(), Some(51821));
        assert_eq!(server.enabled.as_ref().unwrap().value(), Some(false));
        assert!(server.clients.is_empty());
    }
}
