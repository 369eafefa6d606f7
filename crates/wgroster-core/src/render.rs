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

//! wg-quick configuration text.

use std::fmt;

use ipnetwork::IpNetwork;
use wgroster_types::{Client, Server};

/// The server's wg-quick file: its interface plus one peer per enabled client.
pub struct ServerConfig<'a>(pub &'a Server);

/// A client's wg-quick file, pointing at its server.
pub struct ClientConfig<'a> {
    pub server: &'a Server,
    pub client: &'a Client,
}

pub fn server_config(server: &Server) -> String {
    ServerConfig(server).to_string()
}

pub fn client_config(server: &Server, client: &Client) -> String {
    ClientConfig { server, client }.to_string()
}

fn nat_rules(f: &mut fmt::Formatter<'_>, server: &Server, iface: &str) -> fmt::Result {
    let (tables, subnet) = match server.address {
        IpNetwork::V4(net) => ("iptables", format!("{}/{}", net.network(), net.prefix())),
        IpNetwork::V6(net) => ("ip6tables", format!("{}/{}", net.network(), net.prefix())),
    };
    for (hook, op) in [("PostUp", 'A'), ("PostDown", 'D')] {
        writeln!(
            f,
            "{hook} = {tables} -t nat -{op} POSTROUTING -s {subnet} -o {iface} -j MASQUERADE; \
             {tables} -{op} INPUT -p udp -m udp --dport {port} -j ACCEPT; \
             {tables} -{op} FORWARD -i %i -j ACCEPT; \
             {tables} -{op} FORWARD -o %i -j ACCEPT",
            port = server.port,
        )?;
    }
    Ok(())
}

impl fmt::Display for ServerConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let server = self.0;
        writeln!(f, "# {} ({})", server.name, server.id)?;
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", server.private_key)?;
        writeln!(f, "Address = {}", server.address)?;
        writeln!(f, "ListenPort = {}", server.port)?;
        if let Some(iface) = &server.public_interface {
            nat_rules(f, server, iface)?;
        }

        for client in server.enabled_clients() {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "# {}", client.name)?;
            writeln!(f, "# id: {}", client.id)?;
            writeln!(f, "PublicKey = {}", client.public_key)?;
            if let Some(psk) = &client.preshared_key {
                writeln!(f, "PresharedKey = {psk}")?;
            }
            writeln!(f, "AllowedIPs = {}", client.address)?;
        }
        Ok(())
    }
}

/// `host:port`, bracketing bare IPv6 literals.
fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl fmt::Display for ClientConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { server, client } = self;
        writeln!(f, "# {}", client.name)?;
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", client.private_key)?;
        writeln!(f, "Address = {}", client.address)?;
        if !client.dns.is_empty() {
            writeln!(f, "DNS = {}", client.dns.join(", "))?;
        }

        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", server.public_key)?;
        if let Some(psk) = &client.preshared_key {
            writeln!(f, "PresharedKey = {psk}")?;
        }
        writeln!(f, "Endpoint = {}", endpoint(&server.endpoint, server.port))?;
        writeln!(f, "AllowedIPs = {}", client.allowed_ips.join(", "))?;
        if client.persistent_keepalive > 0 {
            writeln!(f, "PersistentKeepalive = {}", client.persistent_keepalive)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn make_client(id: &str, address: &str, enabled: bool) -> Client {
        Client {
            id: id.to_string(),
            name: format!("{id}-name"),
            address: address.parse().unwrap(),
            private_key: format!("{id}-priv"),
            public_key: format!("{id}-pub"),
            preshared_key: None,
            dns: vec![],
            persistent_keepalive: 0,
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            enabled,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn make_server(address: &str, clients: Vec<Client>) -> Server {
        Server {
            id: "wg0".to_string(),
            name: "Home".to_string(),
            address: address.parse().unwrap(),
            dns: vec!["1.1.1.1".to_string()],
            port: 51820,
            endpoint: "vpn.example.com".to_string(),
            preshared_key_policy: false,
            persistent_keepalive: 0,
            private_key: "server-priv".to_string(),
            public_key: "server-pub".to_string(),
            enabled: true,
            public_interface: None,
            clients: clients
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn server_config_lists_enabled_peers_in_address_order() {
        let mut b = make_client("b", "10.10.10.3/32", true);
        b.preshared_key = Some("b-psk".to_string());
        let server = make_server(
            "10.10.10.1/24",
            vec![
                b,
                make_client("a", "10.10.10.2/32", true),
                make_client("off", "10.10.10.4/32", false),
            ],
        );

        let config = server_config(&server);
        assert!(config.contains("PrivateKey = server-priv"));
        assert!(config.contains("Address = 10.10.10.1/24"));
        assert!(config.contains("ListenPort = 51820"));
        assert!(!config.contains("PostUp"));
        assert!(!config.contains("off-pub"));
        assert!(config.contains("PresharedKey = b-psk"));
        assert_eq!(config.matches("[Peer]").count(), 2);

        let a = config.find("PublicKey = a-pub").unwrap();
        let b = config.find("PublicKey = b-pub").unwrap();
        assert!(a < b);
        assert!(config.contains("AllowedIPs = 10.10.10.2/32"));
    }

    #[test_case("10.10.10.1/24", "iptables -t nat -A POSTROUTING -s 10.10.10.0/24 -o eth0" ; "ipv4")]
    #[test_case("fd00::1/64", "ip6tables -t nat -A POSTROUTING -s fd00::/64 -o eth0" ; "ipv6")]
    fn server_config_nat_rules(address: &str, expected: &str) {
        let mut server = make_server(address, vec![]);
        server.public_interface = Some("eth0".to_string());
        let config = server_config(&server);
        assert!(config.contains(expected), "{config}");
        assert!(config.contains("--dport 51820"));
        assert!(config.contains("PostDown = "));
    }

    #[test]
    fn client_config_full() {
        let mut client = make_client("laptop", "10.10.10.2/32", true);
        client.dns = vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()];
        client.preshared_key = Some("psk".to_string());
        client.persistent_keepalive = 25;
        let server = make_server("10.10.10.1/24", vec![client.clone()]);

        let config = client_config(&server, &client);
        assert!(config.contains("PrivateKey = laptop-priv"));
        assert!(config.contains("Address = 10.10.10.2/32"));
        assert!(config.contains("DNS = 1.1.1.1, 9.9.9.9"));
        assert!(config.contains("PublicKey = server-pub"));
        assert!(config.contains("PresharedKey = psk"));
        assert!(config.contains("Endpoint = vpn.example.com:51820"));
        assert!(config.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(config.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn client_config_minimal() {
        let client = make_client("phone", "10.10.10.3/32", true);
        let server = make_server("10.10.10.1/24", vec![client.clone()]);
        let config = client_config(&server, &client);
        assert!(!config.contains("DNS ="));
        assert!(!config.contains("PresharedKey"));
        assert!(!config.contains("PersistentKeepalive"));
    }

    #[test_case("vpn.example.com", "vpn.example.com:51820" ; "hostname")]
    #[test_case("203.0.113.5", "203.0.113.5:51820" ; "ipv4")]
    #[test_case("2001:db8::1", "[2001:db8::1]:51820" ; "ipv6")]
    #[test_case("[2001:db8::1]", "[2001:db8::1]:51820" ; "bracketed ipv6")]
    fn endpoint_formatting(host: &str, expected: &str) {
        assert_eq!(endpoint(host, 51820), expected);
    }
}
