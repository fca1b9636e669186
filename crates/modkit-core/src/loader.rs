//! The per-instance plugin loader.
//!
//! A `Loader` imports plugin records — from host-linked plugins at
//! construction, and from modules it is asked to open — and resolves names,
//! aliases, and interfaces against its own imported set. Loaders are
//! independent: each one only sees the plugins it was asked to load.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::archive;
use crate::backend::{ModuleBackend, ModuleKey, OsBackend};
use crate::error::{PluginError, Result};
use crate::format;
use crate::handle::{HandleManager, LibraryHandle};
use crate::handshake::{self, HostRegistrar};
use crate::instance::{InstanceAware, PluginInstance};
use crate::record::PluginRecord;
use crate::registry::{self, RegistrationSink};

/// Serializes every module-load sequence in the process.
///
/// Loading runs module registration code and touches the process-wide
/// archive; two concurrent loads must not interleave there, regardless of
/// which loader instances they came from.
static LOAD_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// One imported plugin: its record, paired with the handle that keeps the
/// providing module mapped. Host-linked plugins carry no handle.
///
/// The pairing is deliberate — dropping an entry releases the record before
/// the handle, never the other way around.
struct LoadedPlugin {
    record: Option<Arc<PluginRecord>>,
    handle: Option<Arc<LibraryHandle>>,
}

impl LoadedPlugin {
    fn new(record: Arc<PluginRecord>, handle: Option<Arc<LibraryHandle>>) -> Self {
        Self {
            record: Some(record),
            handle,
        }
    }

    fn record(&self) -> &Arc<PluginRecord> {
        self.record
            .as_ref()
            .expect("plugin record is present until teardown")
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        self.record.take();
        self.handle.take();
    }
}

/// Loads modules and resolves the plugins they provide.
pub struct Loader {
    plugins: HashMap<String, LoadedPlugin>,
    aliases: BTreeMap<String, BTreeSet<String>>,
    module_plugins: HashMap<ModuleKey, BTreeSet<String>>,
    handles: HandleManager,
}

impl Loader {
    /// A loader over the platform's real module backend, pre-populated with
    /// every host-linked plugin registered so far.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(OsBackend::new()))
    }

    /// A loader over a caller-supplied module backend.
    pub fn with_backend(backend: Arc<dyn ModuleBackend>) -> Self {
        let mut loader = Self {
            plugins: HashMap::new(),
            aliases: BTreeMap::new(),
            module_plugins: HashMap::new(),
            handles: HandleManager::new(backend),
        };
        loader.store_records(registry::native_records(), None);
        loader
    }

    /// Load the module at `path` and import the plugins it provides.
    ///
    /// Returns the names that became available. A module that opens fine but
    /// provides nothing yields an empty set, not an error.
    pub fn load_module(&mut self, path: impl AsRef<Path>) -> Result<BTreeSet<String>> {
        let path = path.as_ref();
        let _serialized = LOAD_LOCK.lock();

        let handle = match self.handles.open(path) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("{e}");
                return Err(e);
            }
        };

        let records = self.receive_records(&handle, path);
        let mut names = self.store_records(records, Some(&handle));

        if names.is_empty() {
            // A module that registered nothing may be a library that was
            // already linked into the host at build time, in which case its
            // plugins were imported at startup. Probe for their marker
            // symbols to recover the names.
            names = self.probe_native_markers(&handle);

            if names.is_empty() {
                tracing::warn!("the module [{}] provided no plugins", path.display());
            }
        }

        Ok(names)
    }

    /// Collect the records a freshly opened module provides, consulting the
    /// archive first so a module's registration runs only once per process.
    fn receive_records(
        &self,
        handle: &Arc<LibraryHandle>,
        path: &Path,
    ) -> Vec<Arc<PluginRecord>> {
        if let Some(archived) = archive::recall(handle.key()) {
            tracing::debug!(
                "importing {} archived record(s) for [{}]",
                archived.len(),
                path.display()
            );
            return archived;
        }

        let backend = self.handles.backend();

        let mut records: Vec<Arc<PluginRecord>> = Vec::new();

        // Legacy table hook first, then the current entry point; a module in
        // migration may expose both.
        if let Some(reply) = backend.legacy_handshake(handle.key()) {
            match handshake::import_legacy(&reply, path) {
                Ok(legacy) => records.extend(legacy.into_iter().map(Arc::new)),
                Err(e) => tracing::error!("{e}"),
            }
        }

        let mut sink = RegistrationSink::new();
        let mut registrar = HostRegistrar::for_sink(&mut sink);
        backend.run_entry(handle.key(), &mut registrar);
        if sink.failed() {
            tracing::warn!(
                "a plugin registration error was encountered while loading the module [{}]",
                path.display()
            );
        }
        records.extend(sink.drain());

        archive::store(handle.key(), &records);
        records
    }

    /// Merge records into this loader's maps; returns the names imported.
    fn store_records(
        &mut self,
        records: Vec<Arc<PluginRecord>>,
        handle: Option<&Arc<LibraryHandle>>,
    ) -> BTreeSet<String> {
        let mut fresh = BTreeSet::new();

        for record in records {
            let name = record.name().to_string();
            for alias in record.aliases() {
                self.aliases
                    .entry(alias.clone())
                    .or_default()
                    .insert(name.clone());
            }
            self.plugins
                .insert(name.clone(), LoadedPlugin::new(record, handle.cloned()));
            fresh.insert(name);
        }

        if let Some(handle) = handle {
            if !fresh.is_empty() {
                self.module_plugins.insert(handle.key(), fresh.clone());
            }
        }

        fresh
    }

    fn probe_native_markers(&self, handle: &Arc<LibraryHandle>) -> BTreeSet<String> {
        let backend = self.handles.backend();
        let mut provided = BTreeSet::new();
        for record in registry::native_records() {
            let marker = format::marker_symbol(record.identity());
            if backend.has_symbol(handle.key(), &marker) {
                provided.insert(record.name().to_string());
            }
        }
        provided
    }

    /// Every plugin name known to this loader.
    pub fn all_plugins(&self) -> BTreeSet<String> {
        self.plugins.keys().cloned().collect()
    }

    /// Every interface implemented by at least one known plugin, by display
    /// name.
    pub fn interfaces_implemented(&self) -> BTreeSet<String> {
        self.plugins
            .values()
            .flat_map(|entry| entry.record().display_interfaces().iter().cloned())
            .collect()
    }

    /// The plugins implementing `interface`. With `displayed` the interface
    /// is matched by display name, otherwise by raw identity.
    pub fn plugins_implementing(&self, interface: &str, displayed: bool) -> BTreeSet<String> {
        self.plugins
            .values()
            .filter(|entry| {
                let record = entry.record();
                if displayed {
                    record.implements_displayed(interface)
                } else {
                    record.implements(interface)
                }
            })
            .map(|entry| entry.record().name().to_string())
            .collect()
    }

    /// The plugins reachable through `alias`. A plugin whose own name equals
    /// `alias` is included as well.
    pub fn plugins_with_alias(&self, alias: &str) -> BTreeSet<String> {
        let mut result = self.aliases.get(alias).cloned().unwrap_or_default();
        if self.plugins.contains_key(alias) {
            result.insert(alias.to_string());
        }
        result
    }

    /// The aliases declared by the plugin named `name`.
    pub fn aliases_of_plugin(&self, name: &str) -> BTreeSet<String> {
        self.plugins
            .get(name)
            .map(|entry| entry.record().aliases().clone())
            .unwrap_or_default()
    }

    /// Resolve a plugin name or alias to the plugin's name.
    ///
    /// An exact name match wins outright, so a plugin's own name cannot be
    /// shadowed by another plugin's alias. An alias claimed by several
    /// plugins fails, naming every claimant.
    pub fn lookup(&self, name_or_alias: &str) -> Result<String> {
        if self.plugins.contains_key(name_or_alias) {
            return Ok(name_or_alias.to_string());
        }

        match self.aliases.get(name_or_alias) {
            Some(candidates) if candidates.len() == 1 => Ok(candidates
                .iter()
                .next()
                .expect("non-empty alias set has a first element")
                .clone()),
            Some(candidates) if candidates.len() > 1 => Err(PluginError::AmbiguousAlias {
                alias: name_or_alias.to_string(),
                candidates: candidates.clone(),
            }),
            _ => Err(PluginError::NotFound(name_or_alias.to_string())),
        }
    }

    /// Construct a new instance of the named plugin.
    pub fn instantiate(&self, name_or_alias: &str) -> Result<PluginInstance> {
        let resolved = self.lookup(name_or_alias).map_err(|e| {
            tracing::warn!("{e}");
            e
        })?;

        let entry = self.plugins.get(&resolved).unwrap_or_else(|| {
            panic!(
                "the resolved name [{resolved}] is missing from the plugin map; \
                 this should not be possible, please report this bug"
            )
        });
        let record = Arc::clone(entry.record());
        let handle = entry.handle.clone();

        let raw = unsafe { (record.factory())() };
        if raw.is_null() {
            return Err(PluginError::NullInstance(resolved));
        }

        let instance = PluginInstance::new(raw, record, handle);

        if let Some(aware) = unsafe { instance.interface_mut::<dyn InstanceAware>() } {
            aware.attach_instance(&instance);
        }

        Ok(instance)
    }

    /// Drop every plugin imported from the module at `path`, independent of
    /// any reference counting elsewhere. Instances already constructed keep
    /// the module alive until they are gone.
    ///
    /// Returns whether anything was forgotten. Host-linked plugins cannot be
    /// forgotten.
    pub fn forget_module(&mut self, path: impl AsRef<Path>) -> bool {
        match self.handles.key_for_path(path.as_ref()) {
            Some(key) => self.forget_key(key),
            None => false,
        }
    }

    /// Like [`Loader::forget_module`], addressed by one of the module's
    /// plugin names or aliases.
    pub fn forget_module_of_plugin(&mut self, name_or_alias: &str) -> bool {
        let Ok(resolved) = self.lookup(name_or_alias) else {
            return false;
        };
        let key = {
            let Some(entry) = self.plugins.get(&resolved) else {
                return false;
            };
            match &entry.handle {
                // No handle means the plugin is part of the host itself.
                None => return false,
                Some(handle) => handle.key(),
            }
        };
        self.forget_key(key)
    }

    fn forget_key(&mut self, key: ModuleKey) -> bool {
        let Some(names) = self.module_plugins.remove(&key) else {
            return false;
        };

        // Aliases go first, then the record/handle pairs; each pair releases
        // its record before its handle.
        for name in &names {
            if let Some(entry) = self.plugins.get(name) {
                for alias in entry.record().aliases() {
                    if let Some(owners) = self.aliases.get_mut(alias) {
                        owners.remove(name);
                    }
                }
            }
        }
        self.aliases.retain(|_, owners| !owners.is_empty());

        for name in &names {
            self.plugins.remove(name);
        }

        true
    }

    /// A structured snapshot of this loader's state.
    pub fn summary(&self) -> LoaderSummary {
        let mut plugins: Vec<PluginSummary> = self
            .plugins
            .values()
            .map(|entry| {
                let record = entry.record();
                PluginSummary {
                    name: record.name().to_string(),
                    aliases: record.aliases().clone(),
                    interfaces: record.display_interfaces().clone(),
                }
            })
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        let alias_collisions = self
            .aliases
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(alias, owners)| (alias.clone(), owners.clone()))
            .collect();

        LoaderSummary {
            interfaces: self.interfaces_implemented(),
            plugins,
            alias_collisions,
        }
    }

    /// A human-readable dump of the loader's state, including any alias
    /// collisions waiting to bite.
    pub fn pretty_string(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();

        let _ = writeln!(out, "loader state");
        let _ = writeln!(out, "    known interfaces: {}", summary.interfaces.len());
        for interface in &summary.interfaces {
            let _ = writeln!(out, "        {interface}");
        }

        let _ = writeln!(out, "    known plugins: {}", summary.plugins.len());
        for plugin in &summary.plugins {
            let _ = writeln!(out, "        [{}]", plugin.name);
            if plugin.aliases.is_empty() {
                let _ = writeln!(out, "            has no aliases");
            } else {
                let n = plugin.aliases.len();
                let _ = writeln!(
                    out,
                    "            has {n} {}:",
                    if n == 1 { "alias" } else { "aliases" }
                );
                for alias in &plugin.aliases {
                    let _ = writeln!(out, "                [{alias}]");
                }
            }
            let n = plugin.interfaces.len();
            let _ = writeln!(
                out,
                "            implements {n} {}:",
                if n == 1 { "interface" } else { "interfaces" }
            );
            for interface in &plugin.interfaces {
                let _ = writeln!(out, "                {interface}");
            }
        }

        if !summary.alias_collisions.is_empty() {
            let n = summary.alias_collisions.len();
            let _ = writeln!(
                out,
                "    there {} {n} {} with a name collision:",
                if n == 1 { "is" } else { "are" },
                if n == 1 { "alias" } else { "aliases" }
            );
            for (alias, owners) in &summary.alias_collisions {
                let _ = writeln!(out, "        [{alias}] collides between:");
                for owner in owners {
                    let _ = writeln!(out, "            [{owner}]");
                }
            }
        }

        out
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a loader's plugins, interfaces, and alias
/// collisions.
#[derive(Debug, Clone, Serialize)]
pub struct LoaderSummary {
    pub interfaces: BTreeSet<String>,
    pub plugins: Vec<PluginSummary>,
    pub alias_collisions: BTreeMap<String, BTreeSet<String>>,
}

/// One plugin's entry in a [`LoaderSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub aliases: BTreeSet<String>,
    pub interfaces: BTreeSet<String>,
}
