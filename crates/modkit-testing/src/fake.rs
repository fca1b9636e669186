//! An in-process stand-in for the platform module backend.
//!
//! Fake modules are installed under a path and behave like loadable
//! libraries: opening one increments a counter and yields a stable key,
//! running its entry deposits records through the real handshake, and the
//! exit hook releases the registration tokens the way a real module's
//! cleanup would. Tests read the counters back to observe exactly when a
//! module was opened, re-opened, and finally closed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use modkit_core::handshake::{LegacyReply, LegacyTable};
use modkit_core::{
    HostRegistrar, ModuleBackend, ModuleKey, PluginError, PluginRecord, RegistrationToken, Result,
};

static NEXT_KEY: AtomicUsize = AtomicUsize::new(0x1000);

type EntryFn = Box<dyn Fn(&mut HostRegistrar) -> Vec<RegistrationToken> + Send + Sync>;

/// A scripted module the [`FakeBackend`] can open.
#[derive(Default)]
pub struct FakeModule {
    entry: Option<EntryFn>,
    legacy: Option<FakeLegacy>,
    symbols: HashSet<String>,
    fail_open: Option<String>,
}

struct FakeLegacy {
    version: u32,
    size: usize,
    align: usize,
    table: Box<LegacyTable>,
}

impl FakeModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the module's registration entry point.
    pub fn with_entry<F>(mut self, entry: F) -> Self
    where
        F: Fn(&mut HostRegistrar) -> Vec<RegistrationToken> + Send + Sync + 'static,
    {
        self.entry = Some(Box::new(entry));
        self
    }

    /// Convenience entry point that submits whatever `make` produces.
    pub fn with_records<F>(self, make: F) -> Self
    where
        F: Fn() -> Vec<PluginRecord> + Send + Sync + 'static,
    {
        self.with_entry(move |registrar| {
            make()
                .into_iter()
                .filter_map(|record| registrar.submit(record))
                .collect()
        })
    }

    /// Script the module's legacy table hook, reporting the given version
    /// and layout values back to the host.
    pub fn with_legacy(mut self, version: u32, size: usize, align: usize, table: LegacyTable) -> Self {
        self.legacy = Some(FakeLegacy {
            version,
            size,
            align,
            table: Box::new(table),
        });
        self
    }

    /// Pretend the module exports the named symbol.
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbols.insert(symbol.into());
        self
    }

    /// Make every open of this module fail with the given reason.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }
}

struct ModuleState {
    key: ModuleKey,
    module: FakeModule,
    opens: usize,
    closes: usize,
    entry_runs: usize,
    exit_runs: usize,
    tokens: Vec<RegistrationToken>,
}

/// A [`ModuleBackend`] over scripted in-process modules.
#[derive(Default)]
pub struct FakeBackend {
    modules: Mutex<HashMap<PathBuf, ModuleState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fake module under `path` and return the key it will open
    /// under.
    pub fn install(&self, path: impl AsRef<Path>, module: FakeModule) -> ModuleKey {
        let key = NEXT_KEY.fetch_add(0x10, Ordering::Relaxed);
        self.modules.lock().insert(
            path.as_ref().to_path_buf(),
            ModuleState {
                key,
                module,
                opens: 0,
                closes: 0,
                entry_runs: 0,
                exit_runs: 0,
                tokens: Vec::new(),
            },
        );
        key
    }

    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        self.with_state(path.as_ref(), |state| state.opens)
    }

    pub fn close_count(&self, path: impl AsRef<Path>) -> usize {
        self.with_state(path.as_ref(), |state| state.closes)
    }

    pub fn entry_runs(&self, path: impl AsRef<Path>) -> usize {
        self.with_state(path.as_ref(), |state| state.entry_runs)
    }

    pub fn exit_runs(&self, path: impl AsRef<Path>) -> usize {
        self.with_state(path.as_ref(), |state| state.exit_runs)
    }

    /// Whether the module is currently mapped (more opens than closes).
    pub fn is_live(&self, path: impl AsRef<Path>) -> bool {
        self.with_state(path.as_ref(), |state| state.opens > state.closes)
    }

    fn with_state<R>(&self, path: &Path, f: impl FnOnce(&ModuleState) -> R) -> R {
        let modules = self.modules.lock();
        let state = modules
            .get(path)
            .unwrap_or_else(|| panic!("no fake module installed at [{}]", path.display()));
        f(state)
    }
}

impl ModuleBackend for FakeBackend {
    fn open(&self, path: &Path) -> Result<ModuleKey> {
        let mut modules = self.modules.lock();
        let state = modules.get_mut(path).ok_or_else(|| PluginError::OpenFailed {
            path: path.to_path_buf(),
            reason: "no such module".to_string(),
        })?;
        if let Some(reason) = &state.module.fail_open {
            return Err(PluginError::OpenFailed {
                path: path.to_path_buf(),
                reason: reason.clone(),
            });
        }
        state.opens += 1;
        Ok(state.key)
    }

    fn close(&self, key: ModuleKey) {
        let mut modules = self.modules.lock();
        if let Some(state) = modules.values_mut().find(|state| state.key == key) {
            state.closes += 1;
        }
    }

    fn run_entry(&self, key: ModuleKey, registrar: &mut HostRegistrar) -> bool {
        let mut modules = self.modules.lock();
        let Some(state) = modules.values_mut().find(|state| state.key == key) else {
            return false;
        };
        if state.module.entry.is_none() {
            return false;
        }
        state.entry_runs += 1;
        let tokens = match &state.module.entry {
            Some(entry) => entry(registrar),
            None => Vec::new(),
        };
        state.tokens.extend(tokens);
        true
    }

    fn legacy_handshake(&self, key: ModuleKey) -> Option<LegacyReply> {
        let modules = self.modules.lock();
        let state = modules.values().find(|state| state.key == key)?;
        let legacy = state.module.legacy.as_ref()?;
        Some(LegacyReply {
            version: legacy.version,
            size: legacy.size,
            align: legacy.align,
            table: &*legacy.table,
        })
    }

    fn run_exit(&self, key: ModuleKey) {
        let mut modules = self.modules.lock();
        if let Some(state) = modules.values_mut().find(|state| state.key == key) {
            state.exit_runs += 1;
            for token in state.tokens.drain(..) {
                token.release();
            }
        }
    }

    fn has_symbol(&self, key: ModuleKey, symbol: &str) -> bool {
        let modules = self.modules.lock();
        modules
            .values()
            .find(|state| state.key == key)
            .is_some_and(|state| state.module.symbols.contains(symbol))
    }
}
