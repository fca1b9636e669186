//! Loader and registry core for runtime-loaded native plugin modules.
//!
//! A host application creates a [`Loader`], points it at module files, and
//! gets back named plugin records it can instantiate and query by interface —
//! without knowing any plugin at compile time. The crate takes care of the
//! parts that are easy to get wrong:
//!
//! - the **handshake** by which a module hands its records to the host, with
//!   layout validation so a stale module is rejected instead of trusted,
//! - **deduplication** of module handles, so each module is unloaded exactly
//!   once, only after every loader and instance that depends on it is gone,
//! - a process-wide **archive** that lets several independent loaders share
//!   one module's registration without re-running it,
//! - **alias resolution** with collision reporting, and controlled
//!   **unloading**.
//!
//! Plugin modules are built with the companion SDK crate, which generates the
//! entry points this crate resolves.

mod archive;

pub mod backend;
pub mod error;
pub mod format;
pub mod handle;
pub mod handshake;
pub mod instance;
pub mod loader;
pub mod record;
pub mod registry;

pub use backend::{ModuleBackend, ModuleKey, OsBackend};
pub use error::{PluginError, Result};
pub use handle::LibraryHandle;
pub use handshake::{
    with_native_registrar, HostRegistrar, LegacyRecord, LegacyReply, LegacyTable, LegacyTableFn,
    ModuleEntryFn, ModuleExitFn, RegistrationToken, HOST_ABI_VERSION, LEGACY_ABI_VERSION,
    LEGACY_TABLE_SYMBOL, MODULE_ENTRY_SYMBOL, MODULE_EXIT_SYMBOL,
};
pub use instance::{InstanceAware, PluginInstance, WeakPluginInstance};
pub use loader::{Loader, LoaderSummary, PluginSummary};
pub use record::{
    construct_default, destroy_boxed, DestroyFn, FactoryFn, InterfaceCastFn, InterfaceRef,
    PluginRecord, RecordBuilder,
};
pub use registry::RegistrationSink;
