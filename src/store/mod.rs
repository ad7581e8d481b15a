//! Client and evaluation definition store.
//!
//! The server consults definitions only through the [`ClientStore`] trait.
//! [`FileClientStore`] is the shipped implementation: an in-memory snapshot
//! of a directory of TOML files, refreshed by [`watcher::ClientStoreWatcher`].

pub mod loader;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::info;

use crate::models::client::{Client, CredentialCheck};
use crate::models::evaluation::EvaluationDefinition;
use crate::Result;

use self::loader::ClientLoader;

/// Read access to persisted client identities and their evaluations.
pub trait ClientStore: Send + Sync {
    /// Look up a client by base id.
    fn get(&self, client_id: &str) -> Option<Client>;

    /// All known clients, ordered by id.
    fn list_clients(&self) -> Vec<Client>;

    /// Check presented credentials.
    fn validate(&self, client_id: &str, secret_key: Option<&str>) -> CredentialCheck {
        match self.get(client_id) {
            Some(client) => client.check_secret(secret_key),
            None => CredentialCheck::invalid(format!("unknown client '{client_id}'")),
        }
    }

    /// Evaluations owned by a client; empty for unknown clients.
    fn list_evaluations(&self, client_id: &str) -> Vec<EvaluationDefinition> {
        self.get(client_id)
            .map(|client| client.evaluations)
            .unwrap_or_default()
    }

    /// Look up one evaluation of one client.
    fn get_evaluation(&self, client_id: &str, evaluation_id: &str) -> Option<EvaluationDefinition> {
        self.get(client_id)
            .and_then(|client| client.evaluation(evaluation_id).cloned())
    }
}

/// Directory-backed [`ClientStore`] holding an in-memory snapshot.
#[derive(Debug)]
pub struct FileClientStore {
    /// Source directory; `None` for stores built from in-memory clients.
    dir: Option<PathBuf>,
    snapshot: RwLock<HashMap<String, Client>>,
}

impl FileClientStore {
    /// Load every client definition in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directory cannot be read.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        let clients = ClientLoader::load_dir(&dir)?;
        info!(dir = %dir.display(), clients = clients.len(), "client store loaded");
        Ok(Self {
            dir: Some(dir),
            snapshot: RwLock::new(clients),
        })
    }

    /// Build a store from already-parsed clients.
    #[must_use]
    pub fn from_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        let snapshot = clients
            .into_iter()
            .map(|client| (client.client_id.clone(), client))
            .collect();
        Self {
            dir: None,
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Source directory, if the store is file-backed.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Re-read the source directory and swap in the new snapshot.
    ///
    /// Returns the number of clients now loaded. Stores without a source
    /// directory keep their snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directory cannot be read; the
    /// previous snapshot is kept.
    pub fn reload(&self) -> Result<usize> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(self.read().len());
        };
        let clients = ClientLoader::load_dir(dir)?;
        let count = clients.len();
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = clients;
        Ok(count)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Client>> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientStore for FileClientStore {
    fn get(&self, client_id: &str) -> Option<Client> {
        self.read().get(client_id).cloned()
    }

    fn list_clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.read().values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }
}
