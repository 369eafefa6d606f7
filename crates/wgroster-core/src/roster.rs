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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use wgroster_types::{Client, Document, Server};

use crate::keys::KeyProvider;
use crate::registry::{
    ClientError, ClientOverrides, ClientPatch, NewServer, ServerError, ServerPatch, ServerRegistry,
};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

pub type Result<T, E = RosterError> = std::result::Result<T, E>;

/// The registry bound to its store. Every mutation is saved before it
/// becomes visible; a failed mutation or save changes nothing.
pub struct Roster {
    store: Box<dyn RecordStore>,
    registry: Mutex<ServerRegistry>,
}

impl Roster {
    pub fn open(store: Box<dyn RecordStore>, keys: Arc<dyn KeyProvider>) -> Result<Self> {
        let doc = store.load()?;
        let registry = ServerRegistry::from_document(doc, keys)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(Self {
            store,
            registry: Mutex::new(registry),
        })
    }

    // The registry is only ever replaced wholesale, so a poisoned lock still
    // guards a consistent value.
    fn lock(&self) -> MutexGuard<'_, ServerRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a draft copy, persist the draft, then publish it.
    pub fn mutate<T, E>(&self, f: impl FnOnce(&mut ServerRegistry) -> Result<T, E>) -> Result<T>
    where
        RosterError: From<E>,
    {
        let mut current = self.lock();
        let mut draft = current.clone();
        let out = f(&mut draft)?;
        self.store.save(&draft.to_document())?;
        *current = draft;
        debug!("committed roster change");
        Ok(out)
    }

    pub fn read<T>(&self, f: impl FnOnce(&ServerRegistry) -> T) -> T {
        f(&self.lock())
    }

    pub fn document(&self) -> Document {
        self.lock().to_document()
    }

    pub fn server(&self, id: &str) -> Result<Server> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(id.to_string()).into())
    }

    pub fn servers(&self) -> Vec<Server> {
        self.lock().list().cloned().collect()
    }

    /// A server's clients, ordered by address.
    pub fn clients(&self, server_id: &str) -> Result<Vec<Client>> {
        let server = self.server(server_id)?;
        let mut clients: Vec<Client> = server.clients.into_values().collect();
        clients.sort_by_key(|c| c.address.ip());
        Ok(clients)
    }

    pub fn client(&self, server_id: &str, client_id: &str) -> Result<Client> {
        let mut server = self.server(server_id)?;
        server
            .clients
            .remove(client_id)
            .ok_or_else(|| ClientError::NotFound(client_id.to_string()).into())
    }

    // -- Servers --

    pub fn create_server(&self, new: NewServer) -> Result<Server> {
        self.mutate(|reg| reg.create_server(new))
    }

    pub fn update_server(&self, id: &str, patch: ServerPatch) -> Result<Server> {
        self.mutate(|reg| reg.update_server(id, patch))
    }

    pub fn delete_server(&self, id: &str) -> Result<()> {
        self.mutate(|reg| reg.delete_server(id))
    }

    // -- Clients --

    pub fn create_client(
        &self,
        server_id: &str,
        name: &str,
        overrides: ClientOverrides,
    ) -> Result<Client> {
        self.mutate(|reg| -> Result<Client> {
            Ok(reg.client_registry(server_id)?.create(name, overrides)?)
        })
    }

    pub fn update_client(
        &self,
        server_id: &str,
        client_id: &str,
        patch: ClientPatch,
    ) -> Result<Client> {
        self.mutate(|reg| -> Result<Client> {
            Ok(reg.client_registry(server_id)?.update(client_id, patch)?)
        })
    }

    pub fn delete_client(&self, server_id: &str, client_id: &str) -> Result<()> {
        self.mutate(|reg| -> Result<()> {
            Ok(reg.client_registry(server_id)?.delete(client_id)?)
        })
    }

    pub fn rotate_client_keys(&self, server_id: &str, client_id: &str) -> Result<Client> {
        self.mutate(|reg| -> Result<Client> {
            Ok(reg.client_registry(server_id)?.rotate_keys(client_id)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SequentialKeys;
    use crate::store::MemoryStore;

    fn new_server(id: &str) -> NewServer {
        NewServer {
            id: id.to_string(),
            name: id.to_string(),
            address: "10.10.10.1/24".to_string(),
            port: 51820,
            dns: vec![],
            endpoint: "vpn.example.com".to_string(),
            preshared_key_policy: false,
            persistent_keepalive: 0,
            public_interface: None,
        }
    }

    fn roster() -> Roster {
        Roster::open(
            Box::new(MemoryStore::default()),
            Arc::new(SequentialKeys::new()),
        )
        .unwrap()
    }

    #[test]
    fn validation_failure_changes_nothing() {
        let roster = roster();
        roster.create_server(new_server("wg0")).unwrap();
        let before = roster.document();

        let err = roster.create_server(new_server("wg0")).unwrap_err();
        assert!(matches!(err, RosterError::Server(ServerError::DuplicateId(_))));
        assert_eq!(roster.document(), before);
    }

    #[test]
    fn client_errors_keep_their_kind() {
        let roster = roster();
        roster.create_server(new_server("wg0")).unwrap();

        let err = roster
            .create_client("wg0", "  ", ClientOverrides::default())
            .unwrap_err();
        assert!(matches!(err, RosterError::Client(ClientError::EmptyName)));

        let err = roster
            .create_client("nope", "laptop", ClientOverrides::default())
            .unwrap_err();
        assert!(matches!(err, RosterError::Server(ServerError::NotFound(_))));
    }

    #[test]
    fn reads_see_committed_state() {
        let roster = roster();
        roster.create_server(new_server("wg0")).unwrap();
        let client = roster
            .create_client("wg0", "laptop", ClientOverrides::default())
            .unwrap();

        assert_eq!(roster.servers().len(), 1);
        assert_eq!(roster.clients("wg0").unwrap(), vec![client.clone()]);
        assert_eq!(roster.client("wg0", &client.id).unwrap(), client);
        assert!(matches!(
            roster.client("wg0", "missing"),
            Err(RosterError::Client(ClientError::NotFound(_)))
        ));
        assert_eq!(roster.read(|reg| reg.len()), 1);
    }

    #[test]
    fn open_rejects_inconsistent_document() {
        let mut doc = Document::default();
        let mut reg = ServerRegistry::new(Arc::new(SequentialKeys::new()));
        let server = reg.create_server(new_server("wg0")).unwrap();
        doc.servers.insert("other".to_string(), server);

        let err = Roster::open(
            Box::new(MemoryStore::new(doc)),
            Arc::new(SequentialKeys::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RosterError::Persistence(StoreError::Invalid(_))));
    }
}
