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
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key tool {tool} not found")]
    ToolUnavailable { tool: String },

    #[error("`{command}` failed: {detail}")]
    ToolError { command: String, detail: String },
}

/// A base64 encoded WireGuard key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Source of key material for servers and clients.
pub trait KeyProvider: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError>;
    fn generate_preshared_key(&self) -> Result<String, KeyError>;
}

// -- External `wg` tool --

/// Shells out to `wg genkey`, `wg pubkey` and `wg genpsk`.
#[derive(Debug, Clone)]
pub struct WgTool {
    binary: PathBuf,
}

impl WgTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, subcommand: &str, input: Option<&str>) -> Result<String, KeyError> {
        let tool = self.binary.display().to_string();
        let command = format!("{tool} {subcommand}");

        let mut child = Command::new(&self.binary)
            .arg(subcommand)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => KeyError::ToolUnavailable { tool: tool.clone() },
                _ => KeyError::ToolError {
                    command: command.clone(),
                    detail: e.to_string(),
                },
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            // A tool that exits without reading stdin is judged by its exit status.
            match stdin.write_all(input.as_bytes()) {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(KeyError::ToolError {
                        command,
                        detail: e.to_string(),
                    });
                }
                _ => {}
            }
        }

        let output = child.wait_with_output().map_err(|e| KeyError::ToolError {
            command: command.clone(),
            detail: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(KeyError::ToolError {
                command,
                detail: format!("{}: {stderr}", output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(KeyError::ToolError {
                command,
                detail: "no output".to_string(),
            });
        }

        debug!(command = %command, "key tool succeeded");
        Ok(stdout)
    }
}

impl Default for WgTool {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl KeyProvider for WgTool {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        let private_key = self.run("genkey", None)?;
        let public_key = self.run("pubkey", Some(&private_key))?;
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    fn generate_preshared_key(&self) -> Result<String, KeyError> {
        self.run("genpsk", None)
    }
}

// -- Native x25519 --

/// Generates keys in-process from the OS random number generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKeys;

impl KeyProvider for NativeKeys {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        })
    }

    fn generate_preshared_key(&self) -> Result<String, KeyError> {
        let mut psk = [0u8; 32];
        OsRng.fill_bytes(&mut psk);
        Ok(BASE64.encode(psk))
    }
}

// -- Deterministic fixture --

/// Hands out well-formed but predictable keys: the n-th call uses a secret
/// filled with byte `n`. For tests and dry runs only.
#[derive(Debug, Default)]
pub struct SequentialKeys {
    counter: AtomicU8,
}

impl SequentialKeys {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u8 {
        self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

impl KeyProvider for SequentialKeys {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        let secret = StaticSecret::from([self.next(); 32]);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        })
    }

    fn generate_preshared_key(&self) -> Result<String, KeyError> {
        Ok(BASE64.encode([self.next().wrapping_add(0x80); 32]))
    }
}
