//! Reference-counted ownership of opened modules.
//!
//! A [`LibraryHandle`] is the one object whose destruction unloads a module.
//! Every structure that depends on the module's code — the loader's record
//! entries, live plugin instances — holds a strong reference to the handle,
//! so the unload happens exactly once, after the last dependent is gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::backend::{ModuleBackend, ModuleKey};
use crate::error::Result;

/// How many counted handles exist per module across all loaders. The
/// module's cleanup hook runs when the last one goes, not before: another
/// loader may still be using records the module registered.
static LIVE_HANDLES: Lazy<Mutex<HashMap<ModuleKey, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A counted reference to an opened module.
pub struct LibraryHandle {
    key: ModuleKey,
    path: PathBuf,
    backend: Arc<dyn ModuleBackend>,
}

impl LibraryHandle {
    pub fn key(&self) -> ModuleKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        let last = {
            let mut live = LIVE_HANDLES.lock();
            match live.get_mut(&self.key) {
                Some(count) => {
                    *count -= 1;
                    let last = *count == 0;
                    if last {
                        live.remove(&self.key);
                    }
                    last
                }
                None => true,
            }
        };
        // The cleanup hook executes module code, so it must run while the
        // module is still mapped; the close comes last.
        if last {
            self.backend.run_exit(self.key);
        }
        self.backend.close(self.key);
    }
}

impl std::fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("key", &format_args!("{:#x}", self.key))
            .field("path", &self.path)
            .finish()
    }
}

/// Per-loader bookkeeping that guarantees one counted handle per distinct
/// module.
pub(crate) struct HandleManager {
    backend: Arc<dyn ModuleBackend>,
    live: HashMap<ModuleKey, Weak<LibraryHandle>>,
    paths: HashMap<PathBuf, ModuleKey>,
}

impl HandleManager {
    pub(crate) fn new(backend: Arc<dyn ModuleBackend>) -> Self {
        Self {
            backend,
            live: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    pub(crate) fn backend(&self) -> Arc<dyn ModuleBackend> {
        Arc::clone(&self.backend)
    }

    /// Open `path` and return its counted handle.
    ///
    /// If this loader already holds a live handle for the same module, the
    /// duplicate platform open is undone immediately and the existing handle
    /// is shared, keeping a single authoritative reference chain per module.
    pub(crate) fn open(&mut self, path: &Path) -> Result<Arc<LibraryHandle>> {
        let key = self.backend.open(path)?;

        if let Some(existing) = self.live.get(&key).and_then(Weak::upgrade) {
            self.backend.close(key);
            return Ok(existing);
        }

        let handle = Arc::new(LibraryHandle {
            key,
            path: path.to_path_buf(),
            backend: Arc::clone(&self.backend),
        });
        *LIVE_HANDLES.lock().entry(key).or_insert(0) += 1;
        self.live.insert(key, Arc::downgrade(&handle));
        self.paths.insert(Self::index_path(path), key);
        Ok(handle)
    }

    /// The module key a path was opened under, if this loader ever opened it.
    pub(crate) fn key_for_path(&self, path: &Path) -> Option<ModuleKey> {
        self.paths.get(&Self::index_path(path)).copied()
    }

    fn index_path(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }
}
