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

mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use wgroster_core::config::{ConfigError, DEFAULT_CONFIG_PATH, KeyBackend, Settings};

fn init_tracing(verbosity: u8) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries rendered configs and listings.
    #[cfg(distribute)]
    {
        fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    #[cfg(not(distribute))]
    {
        fmt()
            .pretty()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "wgroster")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Manage WireGuard servers, their clients and generated configs")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path to the roster document, overriding config and environment
    #[arg(long, global = true)]
    document: Option<PathBuf>,

    /// Key backend: wg-tool or native
    #[arg(long, global = true)]
    keys: Option<KeyBackend>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Config file, then environment, then flags.
    fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::from_file_and_env(&self.config)?;
        if let Some(document) = &self.document {
            settings.document = document.clone();
        }
        if let Some(keys) = self.keys {
            settings.keys = keys;
        }
        Ok(settings)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage servers
    #[command(subcommand)]
    Server(ServerCommand),

    /// Manage the clients of a server
    #[command(subcommand)]
    Client(ClientCommand),

    /// Print wg-quick configuration files
    #[command(subcommand)]
    Render(RenderCommand),

    /// Upgrade a document written by an older release
    Migrate {
        /// Id given to the server of a single-server document
        #[arg(long, default_value = "wg0")]
        server_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum ServerCommand {
    /// Create a server and generate its keys
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Interface address with prefix, e.g. 10.10.10.1/24
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 51820)]
        port: u32,
        #[arg(long, value_delimiter = ',')]
        dns: Vec<String>,
        /// Public host name or address clients connect to
        #[arg(long)]
        endpoint: String,
        /// Give new clients a pre-shared key by default
        #[arg(long)]
        psk: bool,
        #[arg(long, default_value_t = 0)]
        keepalive: u16,
        /// Uplink interface for the NAT rules in the rendered config
        #[arg(long)]
        public_interface: Option<String>,
    },

    /// List servers
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one server
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Change server settings
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        port: Option<u32>,
        #[arg(long, value_delimiter = ',')]
        dns: Option<Vec<String>>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, conflicts_with = "no_psk")]
        psk: bool,
        #[arg(long)]
        no_psk: bool,
        #[arg(long)]
        keepalive: Option<u16>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long, conflicts_with = "no_public_interface")]
        public_interface: Option<String>,
        #[arg(long)]
        no_public_interface: bool,
    },

    /// Remove a server and all of its clients
    Rm { id: String },
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Create a client with the next free address
    Add {
        server: String,
        name: String,
        #[arg(long, value_delimiter = ',')]
        dns: Option<Vec<String>>,
        #[arg(long)]
        keepalive: Option<u16>,
        /// Routed range, repeatable; defaults to the configured allowed_ips
        #[arg(long = "allowed-ip")]
        allowed_ips: Vec<String>,
        #[arg(long, conflicts_with = "no_psk")]
        psk: bool,
        #[arg(long)]
        no_psk: bool,
        #[arg(long)]
        disabled: bool,
    },

    /// List a server's clients
    List {
        server: String,
        #[arg(long)]
        json: bool,
    },

    /// Change client settings
    Edit {
        server: String,
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// New host address inside the server subnet
        #[arg(long)]
        address: Option<String>,
        #[arg(long, value_delimiter = ',')]
        dns: Option<Vec<String>>,
        #[arg(long)]
        keepalive: Option<u16>,
        #[arg(long = "allowed-ip")]
        allowed_ips: Vec<String>,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        /// Set the pre-shared key
        #[arg(long, conflicts_with = "clear_psk")]
        psk: Option<String>,
        #[arg(long)]
        clear_psk: bool,
    },

    /// Remove a client
    Rm { server: String, id: String },

    /// Replace a client's keys
    RotateKeys { server: String, id: String },
}

#[derive(Debug, Subcommand)]
enum RenderCommand {
    /// The server's wg-quick file
    Server {
        id: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// A client's wg-quick file
    Client {
        server: String,
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let settings = args.settings()?;
    debug!(
        document = %settings.document.display(),
        keys = %settings.keys,
        "resolved settings"
    );

    commands::run(args.command, &settings)?;
    Ok(())
}
