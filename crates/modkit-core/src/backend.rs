//! Platform access to loadable modules.
//!
//! The loader talks to the operating system through the [`ModuleBackend`]
//! trait so the open/close bookkeeping, the handshake sequence, and the
//! registry semantics can all be exercised against an in-process stand-in.
//! [`OsBackend`] is the real implementation over `libloading`.

use std::ffi::c_void;
use std::mem::{self, ManuallyDrop};
use std::path::Path;

use crate::error::{PluginError, Result};
use crate::handshake::{
    HostRegistrar, LegacyReply, LegacyRecord, LegacyTable, LegacyTableFn, ModuleEntryFn,
    ModuleExitFn, LEGACY_ABI_VERSION, LEGACY_TABLE_SYMBOL, MODULE_ENTRY_SYMBOL,
    MODULE_EXIT_SYMBOL,
};

/// Identity of an opened module: the numeric value of its OS handle.
///
/// Opening the same library twice yields the same key, which is what makes
/// per-loader handle deduplication possible.
pub type ModuleKey = usize;

/// Operations the loader needs from the platform.
pub trait ModuleBackend: Send + Sync {
    /// Open the module at `path`. Repeated opens of the same module return
    /// the same key, with the platform's own reference count incremented.
    fn open(&self, path: &Path) -> Result<ModuleKey>;

    /// Undo one `open` of this module.
    fn close(&self, key: ModuleKey);

    /// Invoke the module's registration entry point, if it exports one.
    /// Returns whether an entry point was found.
    fn run_entry(&self, key: ModuleKey, registrar: &mut HostRegistrar) -> bool;

    /// Call the module's legacy table hook, if it exports one.
    fn legacy_handshake(&self, key: ModuleKey) -> Option<LegacyReply>;

    /// Invoke the module's cleanup hook, if it exports one. Called right
    /// before the final close.
    fn run_exit(&self, key: ModuleKey);

    /// Whether the module exports the named symbol.
    fn has_symbol(&self, key: ModuleKey, symbol: &str) -> bool;
}

/// The real platform backend.
#[derive(Default)]
pub struct OsBackend;

impl OsBackend {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use libloading::os::unix::{Library, RTLD_LAZY, RTLD_LOCAL};

    pub(super) fn open(path: &Path) -> Result<ModuleKey> {
        // RTLD_LOCAL keeps the symbols of unrelated modules from writing
        // over each other.
        match unsafe { Library::open(Some(path), RTLD_LAZY | RTLD_LOCAL) } {
            Ok(library) => Ok(library.into_raw() as ModuleKey),
            Err(e) => Err(PluginError::OpenFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    pub(super) fn close(key: ModuleKey) {
        drop(unsafe { Library::from_raw(key as *mut c_void) });
    }

    /// Resolve `symbol` without giving up ownership of the handle.
    pub(super) fn symbol<T: Copy>(key: ModuleKey, symbol: &str) -> Option<T> {
        let library = ManuallyDrop::new(unsafe { Library::from_raw(key as *mut c_void) });
        match unsafe { library.get::<T>(symbol.as_bytes()) } {
            Ok(found) => Some(*found),
            Err(_) => None,
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use libloading::os::windows::Library;

    pub(super) fn open(path: &Path) -> Result<ModuleKey> {
        match unsafe { Library::new(path) } {
            Ok(library) => Ok(library.into_raw() as ModuleKey),
            Err(e) => Err(PluginError::OpenFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    pub(super) fn close(key: ModuleKey) {
        drop(unsafe { Library::from_raw(key as _) });
    }

    pub(super) fn symbol<T: Copy>(key: ModuleKey, symbol: &str) -> Option<T> {
        let library = ManuallyDrop::new(unsafe { Library::from_raw(key as _) });
        match unsafe { library.get::<T>(symbol.as_bytes()) } {
            Ok(found) => Some(*found),
            Err(_) => None,
        }
    }
}

impl ModuleBackend for OsBackend {
    fn open(&self, path: &Path) -> Result<ModuleKey> {
        os::open(path)
    }

    fn close(&self, key: ModuleKey) {
        os::close(key);
    }

    fn run_entry(&self, key: ModuleKey, registrar: &mut HostRegistrar) -> bool {
        match os::symbol::<ModuleEntryFn>(key, MODULE_ENTRY_SYMBOL) {
            Some(entry) => {
                unsafe { entry(registrar) };
                true
            }
            None => false,
        }
    }

    fn legacy_handshake(&self, key: ModuleKey) -> Option<LegacyReply> {
        let hook = os::symbol::<LegacyTableFn>(key, LEGACY_TABLE_SYMBOL)?;

        // Seed the out-parameters with the host's expectations; the module
        // overwrites them with its own compiled values.
        let mut version = LEGACY_ABI_VERSION;
        let mut size = mem::size_of::<LegacyRecord>();
        let mut align = mem::align_of::<LegacyRecord>();
        let table: *const LegacyTable = unsafe { hook(&mut version, &mut size, &mut align) };

        Some(LegacyReply {
            version,
            size,
            align,
            table,
        })
    }

    fn run_exit(&self, key: ModuleKey) {
        if let Some(exit) = os::symbol::<ModuleExitFn>(key, MODULE_EXIT_SYMBOL) {
            unsafe { exit() };
        }
    }

    fn has_symbol(&self, key: ModuleKey, symbol: &str) -> bool {
        os::symbol::<*mut c_void>(key, symbol).is_some()
    }
}
