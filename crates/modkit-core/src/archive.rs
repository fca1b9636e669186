//! Process-wide archive of the records each loaded module has contributed.
//!
//! A module's registration entry point runs only the first time the module is
//! opened; a second loader opening the same module would otherwise see
//! nothing. The archive remembers, per module identity, non-owning references
//! to the records it produced, so later loads can import them directly.
//!
//! References are weak on purpose: once a module is fully unloaded and the
//! last owner of its records is gone, the entry dies by itself and is pruned
//! the next time it is touched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::backend::ModuleKey;
use crate::record::PluginRecord;

struct ArchivedRecord {
    address: usize,
    record: Weak<PluginRecord>,
}

#[derive(Default)]
struct Archive {
    by_module: HashMap<ModuleKey, Vec<ArchivedRecord>>,
    owner_of: HashMap<usize, ModuleKey>,
}

static ARCHIVE: Lazy<Mutex<Archive>> = Lazy::new(|| Mutex::new(Archive::default()));

/// Remember the records a module contributed.
///
/// Modules that contributed nothing get no entry: the archive relies on
/// plugin modules cleaning themselves out when they unload, and entries for
/// non-plugin libraries would accumulate as stale bookkeeping.
pub(crate) fn store(key: ModuleKey, records: &[Arc<PluginRecord>]) {
    if records.is_empty() {
        return;
    }
    let mut archive = ARCHIVE.lock();
    let entry = archive.by_module.entry(key).or_default();
    for record in records {
        let address = Arc::as_ptr(record) as usize;
        entry.push(ArchivedRecord {
            address,
            record: Arc::downgrade(record),
        });
    }
    for record in records {
        archive
            .owner_of
            .insert(Arc::as_ptr(record) as usize, key);
    }
}

/// Recover the records a previously seen module contributed.
///
/// Returns `None` when the module is unknown, or when its entry turned out to
/// be stale (all owners gone); stale entries are pruned on the way out so the
/// caller can run a fresh registration.
pub(crate) fn recall(key: ModuleKey) -> Option<Vec<Arc<PluginRecord>>> {
    let mut archive = ARCHIVE.lock();
    let entry = archive.by_module.get(&key)?;

    let mut records = Vec::with_capacity(entry.len());
    let mut stale_addresses = None;
    for archived in entry {
        match archived.record.upgrade() {
            Some(record) => records.push(record),
            None => {
                stale_addresses = Some(entry.iter().map(|a| a.address).collect::<Vec<_>>());
                break;
            }
        }
    }

    match stale_addresses {
        None => Some(records),
        Some(addresses) => {
            tracing::debug!("pruning stale archive entry for module {key:#x}");
            archive.by_module.remove(&key);
            for address in addresses {
                archive.owner_of.remove(&address);
            }
            None
        }
    }
}

/// Drop the archive entry owning the record at `address`.
///
/// Called when a module releases one of its registration tokens during
/// unload. The whole module entry goes at once; sibling tokens release as
/// no-ops afterwards.
pub(crate) fn forget_record(address: usize) {
    let mut archive = ARCHIVE.lock();
    if let Some(key) = archive.owner_of.remove(&address) {
        if let Some(entry) = archive.by_module.remove(&key) {
            for archived in entry {
                archive.owner_of.remove(&archived.address);
            }
        }
    }
}
