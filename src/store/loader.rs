//! Client definition directory loader.
//!
//! Parses every `*.toml` file in the clients directory into a [`Client`].
//! A file that fails to read, parse, or validate is skipped with a warning;
//! the remaining files still load.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::models::client::Client;
use crate::{AppError, Result};

/// Extension of client definition files.
const CLIENT_FILE_EXTENSION: &str = "toml";

/// Loads client definitions from disk.
pub struct ClientLoader;

impl ClientLoader {
    /// Load all client definitions in `dir`, keyed by client id.
    ///
    /// # Behaviour
    ///
    /// - **Unreadable/malformed/invalid file**: skipped, logged at `WARN`.
    /// - **Duplicate client id**: the later file (by file name order) is
    ///   skipped, logged at `WARN`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` only if the directory itself cannot be read.
    pub fn load_dir(dir: &Path) -> Result<HashMap<String, Client>> {
        let entries = fs::read_dir(dir).map_err(|err| {
            AppError::Store(format!(
                "failed to read clients directory {}: {err}",
                dir.display()
            ))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == CLIENT_FILE_EXTENSION)
            })
            .collect();
        paths.sort();

        let mut clients = HashMap::new();
        for path in paths {
            let client = match Self::load_file(&path) {
                Ok(client) => client,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping client definition file");
                    continue;
                }
            };

            if clients.contains_key(&client.client_id) {
                warn!(
                    path = %path.display(),
                    client_id = %client.client_id,
                    "duplicate client id, skipping file"
                );
                continue;
            }

            debug!(
                client_id = %client.client_id,
                evaluations = client.evaluations.len(),
                "loaded client definition"
            );
            clients.insert(client.client_id.clone(), client);
        }

        Ok(clients)
    }

    /// Parse and validate one client definition file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file cannot be read, is not valid
    /// TOML for a [`Client`], or fails [`Client::validate`].
    pub fn load_file(path: &Path) -> Result<Client> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Store(format!("failed to read {}: {err}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parse and validate a client definition from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` on parse or validation failure.
    pub fn parse(raw: &str) -> Result<Client> {
        let client: Client = toml::from_str(raw)
            .map_err(|err| AppError::Store(format!("invalid client definition: {err}")))?;
        client.validate()?;
        Ok(client)
    }
}
