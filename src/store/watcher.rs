//! Hot-reload file watcher for the clients directory.
//!
//! Watches the directory backing a [`FileClientStore`] with the `notify`
//! crate and reloads the whole snapshot whenever a `*.toml` file is created,
//! modified, or removed. A failed reload keeps the previous snapshot.

use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, info_span, warn};

use super::FileClientStore;
use crate::{AppError, Result};

/// Keeps the underlying OS watcher alive; dropping it stops reloads.
pub struct ClientStoreWatcher {
    _watcher: RecommendedWatcher,
}

impl ClientStoreWatcher {
    /// Start watching the directory behind `store`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the store has no source directory or the
    /// watcher cannot be created.
    pub fn start(store: Arc<FileClientStore>) -> Result<Self> {
        let Some(dir) = store.dir().map(std::path::Path::to_owned) else {
            return Err(AppError::Store(
                "cannot watch a store without a source directory".into(),
            ));
        };

        let reload_store = Arc::clone(&store);
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_client_file_event(&event) => {
                    let _span = info_span!("client_store_reload").entered();
                    match reload_store.reload() {
                        Ok(count) => info!(clients = count, "hot-reloaded client definitions"),
                        Err(err) => warn!(%err, "failed to reload client definitions"),
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "file watcher error"),
            },
        )
        .map_err(|err| AppError::Store(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| AppError::Store(format!("failed to watch directory: {err}")))?;

        info!(dir = %dir.display(), "watching client definitions");
        Ok(Self { _watcher: watcher })
    }
}

/// Check whether a notify event relates to a client definition file.
fn is_client_file_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.extension().is_some_and(|ext| ext == "toml"))
}
