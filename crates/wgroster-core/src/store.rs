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

use std::fmt;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info};
use wgroster_types::{Document, SCHEMA_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacySchema {
    /// `{ "server": {...}, "clients": {...} }`
    SingleServer,
    /// `{ "servers": {...} }` with no `version` key.
    UnversionedMulti,
}

impl fmt::Display for LegacySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleServer => f.write_str("single-server"),
            Self::UnversionedMulti => f.write_str("unversioned multi-server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Current,
    Legacy(LegacySchema),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{} uses the legacy {schema} layout; migrate it first", path.display())]
    LegacySchema { path: PathBuf, schema: LegacySchema },

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u64),

    #[error("unrecognized document layout")]
    UnrecognizedSchema,

    #[error("invalid document: {0}")]
    Invalid(String),
}

/// Tell the current schema apart from the layouts older releases wrote.
pub fn detect_schema(value: &Value) -> Result<Schema, StoreError> {
    let obj = value.as_object().ok_or(StoreError::UnrecognizedSchema)?;
    match obj.get("version") {
        Some(version) => match version.as_u64() {
            Some(v) if v == u64::from(SCHEMA_VERSION) => Ok(Schema::Current),
            Some(v) => Err(StoreError::UnsupportedVersion(v)),
            None => Err(StoreError::UnrecognizedSchema),
        },
        None if obj.contains_key("servers") => Ok(Schema::Legacy(LegacySchema::UnversionedMulti)),
        None if obj.contains_key("server") => Ok(Schema::Legacy(LegacySchema::SingleServer)),
        None => Err(StoreError::UnrecognizedSchema),
    }
}

/// Where the document lives. Both operations may fail; a failed save must
/// not be treated as committed.
pub trait RecordStore: Send + Sync {
    fn load(&self) -> Result<Document, StoreError>;
    fn save(&self, doc: &Document) -> Result<(), StoreError>;
}

// -- JSON file --

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file as untyped JSON, or `None` if it does not exist.
    pub fn read_raw(&self) -> Result<Option<Value>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Copy the current file to `<path>.bak`.
    pub fn backup(&self) -> Result<PathBuf, StoreError> {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        std::fs::copy(&self.path, &backup).map_err(|source| StoreError::Write {
            path: backup.clone(),
            source,
        })?;
        info!(path = %backup.display(), "wrote backup");
        Ok(backup)
    }

    fn write_err(&self, source: io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// The document carries every private key, so only the owner may read it.
fn write_owner_only(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its bits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)
}

impl RecordStore for JsonFileStore {
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<Document, StoreError> {
        let Some(value) = self.read_raw()? else {
            info!("document not found, starting with an empty one");
            return Ok(Document::default());
        };

        match detect_schema(&value)? {
            Schema::Current => {
                let doc: Document =
                    serde_json::from_value(value).map_err(|source| StoreError::Parse {
                        path: self.path.clone(),
                        source,
                    })?;
                debug!(server_count = doc.servers.len(), "loaded document");
                Ok(doc)
            }
            Schema::Legacy(schema) => Err(StoreError::LegacySchema {
                path: self.path.clone(),
                schema,
            }),
        }
    }

    #[tracing::instrument(skip(self, doc), fields(path = %self.path.display()))]
    fn save(&self, doc: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.write_err(e))?;
        }

        let mut contents = serde_json::to_string_pretty(doc)?;
        contents.push('\n');

        // Write beside the target and rename so a crash never leaves half a file.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_owner_only(&tmp, contents.as_bytes()).map_err(|e| self.write_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.write_err(e))?;

        info!(server_count = doc.servers.len(), "saved document");
        Ok(())
    }
}

// -- In memory --

/// Keeps the document in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<Document>,
}

impl MemoryStore {
    pub fn new(doc: Document) -> Self {
        Self {
            doc: Mutex::new(doc),
        }
    }

    pub fn document(&self) -> Document {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RecordStore for MemoryStore {
    fn load(&self) -> Result<Document, StoreError> {
        Ok(self.document())
    }

    fn save(&self, doc: &Document) -> Result<(), StoreError> {
        *self.doc.lock().unwrap_or_else(PoisonError::into_inner) = doc.clone();
        Ok(())
    }
}
