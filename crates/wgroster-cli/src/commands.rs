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

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;
use wgroster_core::config::Settings;
use wgroster_core::migrate::{self, MigrateError};
use wgroster_core::registry::{ClientOverrides, ClientPatch, NewServer, ServerPatch};
use wgroster_core::render;
use wgroster_core::roster::{Roster, RosterError};
use wgroster_core::types::{Client, Server};

use crate::{ClientCommand, Command, RenderCommand, ServerCommand};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn run(command: Command, settings: &Settings) -> Result<(), CliError> {
    let open = || Roster::open(Box::new(settings.document_store()), settings.key_provider());

    match command {
        Command::Server(cmd) => server(&open()?, cmd),
        Command::Client(cmd) => client(&open()?, settings, cmd),
        Command::Render(cmd) => render(&open()?, cmd),
        Command::Migrate { server_id } => {
            let store = settings.document_store();
            let report = migrate::migrate_file(&store, &server_id, settings.key_provider().as_ref())?;
            println!(
                "migrated {} layout: {} servers, {} clients, {} regenerated key pairs",
                report.schema, report.servers, report.clients, report.regenerated_keys
            );
            println!("previous file kept at {}", report.backup.display());
            Ok(())
        }
    }
}

/// `Some(true)` for the first flag, `Some(false)` for the second.
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn server_line(server: &Server) -> String {
    format!(
        "{}\t{}\t{}\t:{}\t{}\t{} clients",
        server.id,
        server.name,
        server.address,
        server.port,
        if server.enabled { "enabled" } else { "disabled" },
        server.clients.len()
    )
}

fn client_line(client: &Client) -> String {
    format!(
        "{}\t{}\t{}\t{}{}",
        client.id,
        client.name,
        client.address,
        if client.enabled { "enabled" } else { "disabled" },
        if client.preshared_key.is_some() { "\tpsk" } else { "" }
    )
}

// -- server --

fn server(roster: &Roster, cmd: ServerCommand) -> Result<(), CliError> {
    match cmd {
        ServerCommand::Add {
            id,
            name,
            address,
            port,
            dns,
            endpoint,
            psk,
            keepalive,
            public_interface,
        } => {
            let server = roster.create_server(NewServer {
                id,
                name,
                address,
                port,
                dns,
                endpoint,
                preshared_key_policy: psk,
                persistent_keepalive: keepalive,
                public_interface,
            })?;
            println!("{}", server_line(&server));
        }
        ServerCommand::List { json } => {
            let servers = roster.servers();
            if json {
                print_json(&servers)?;
            } else {
                for server in &servers {
                    println!("{}", server_line(server));
                }
            }
        }
        ServerCommand::Show { id, json } => {
            let server = roster.server(&id)?;
            if json {
                print_json(&server)?;
            } else {
                println!("id:          {}", server.id);
                println!("name:        {}", server.name);
                println!("address:     {}", server.address);
                println!("port:        {}", server.port);
                println!("endpoint:    {}", server.endpoint);
                println!("dns:         {}", server.dns.join(", "));
                println!("public key:  {}", server.public_key);
                println!("psk policy:  {}", server.preshared_key_policy);
                println!("keepalive:   {}", server.persistent_keepalive);
                println!("enabled:     {}", server.enabled);
                if let Some(iface) = &server.public_interface {
                    println!("uplink:      {iface}");
                }
                println!("clients:     {}", server.clients.len());
            }
        }
        ServerCommand::Edit {
            id,
            name,
            address,
            port,
            dns,
            endpoint,
            psk,
            no_psk,
            keepalive,
            enable,
            disable,
            public_interface,
            no_public_interface,
        } => {
            let public_interface = match (public_interface, no_public_interface) {
                (Some(iface), _) => Some(Some(iface)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            let server = roster.update_server(
                &id,
                ServerPatch {
                    name,
                    address,
                    port,
                    dns,
                    endpoint,
                    preshared_key_policy: toggle(psk, no_psk),
                    persistent_keepalive: keepalive,
                    enabled: toggle(enable, disable),
                    public_interface,
                },
            )?;
            println!("{}", server_line(&server));
        }
        ServerCommand::Rm { id } => {
            roster.delete_server(&id)?;
            info!(server_id = %id, "server removed");
        }
    }
    Ok(())
}

// -- client --

fn client(roster: &Roster, settings: &Settings, cmd: ClientCommand) -> Result<(), CliError> {
    match cmd {
        ClientCommand::Add {
            server,
            name,
            dns,
            keepalive,
            allowed_ips,
            psk,
            no_psk,
            disabled,
        } => {
            let allowed_ips = if allowed_ips.is_empty() {
                settings.allowed_ips.clone()
            } else {
                allowed_ips
            };
            let client = roster.create_client(
                &server,
                &name,
                ClientOverrides {
                    dns,
                    persistent_keepalive: keepalive,
                    allowed_ips: Some(allowed_ips),
                    preshared_key: toggle(psk, no_psk),
                    enabled: disabled.then_some(false),
                },
            )?;
            println!("{}", client_line(&client));
        }
        ClientCommand::List { server, json } => {
            let clients = roster.clients(&server)?;
            if json {
                print_json(&clients)?;
            } else {
                for client in &clients {
                    println!("{}", client_line(client));
                }
            }
        }
        ClientCommand::Edit {
            server,
            id,
            name,
            address,
            dns,
            keepalive,
            allowed_ips,
            enable,
            disable,
            psk,
            clear_psk,
        } => {
            let preshared_key = match (psk, clear_psk) {
                (Some(key), _) => Some(Some(key)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            let client = roster.update_client(
                &server,
                &id,
                ClientPatch {
                    name,
                    dns,
                    address,
                    persistent_keepalive: keepalive,
                    allowed_ips: (!allowed_ips.is_empty()).then_some(allowed_ips),
                    enabled: toggle(enable, disable),
                    preshared_key,
                },
            )?;
            println!("{}", client_line(&client));
        }
        ClientCommand::Rm { server, id } => {
            roster.delete_client(&server, &id)?;
            info!(server_id = %server, client_id = %id, "client removed");
        }
        ClientCommand::RotateKeys { server, id } => {
            let client = roster.rotate_client_keys(&server, &id)?;
            println!("{}", client_line(&client));
        }
    }
    Ok(())
}

// -- render --

fn render(roster: &Roster, cmd: RenderCommand) -> Result<(), CliError> {
    let (text, out) = match cmd {
        RenderCommand::Server { id, out } => (render::server_config(&roster.server(&id)?), out),
        RenderCommand::Client { server, id, out } => {
            let client = roster.client(&server, &id)?;
            let server = roster.server(&server)?;
            (render::client_config(&server, &client), out)
        }
    };

    match out {
        Some(path) => write_private(&path, &text),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}

/// Write a file only the owner can read; it carries a private key.
fn write_private(path: &Path, contents: &str) -> Result<(), CliError> {
    let err = |source| CliError::Output {
        path: path.to_path_buf(),
        source,
    };

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(err)?;
    // `mode` only applies on creation; tighten a file that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(err)?;
    }
    file.write_all(contents.as_bytes()).map_err(err)?;
    info!(path = %path.display(), "wrote config");
    Ok(())
}
