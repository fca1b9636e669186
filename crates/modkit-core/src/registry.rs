//! Registration sinks: the collections a module deposits records into.
//!
//! Two kinds of sink exist. The *native* sink is process-wide and holds the
//! records of plugins linked directly into the host; it is filled during
//! application startup and never cleared. A *load* sink is created fresh for
//! each module-load call, handed to the module's entry point, drained into the
//! calling loader, and discarded — so records only ever reach the loader that
//! asked for them.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::record::PluginRecord;

/// Records deposited by plugin registration, keyed by type identity.
#[derive(Default)]
pub struct RegistrationSink {
    records: HashMap<String, Arc<PluginRecord>>,
    failed: bool,
}

impl RegistrationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, merging with any existing registration of the same
    /// identity. Returns the record as stored.
    pub fn insert(&mut self, record: PluginRecord) -> Arc<PluginRecord> {
        let identity = record.identity().to_string();
        let stored = match self.records.get(&identity) {
            Some(existing) => Arc::new(existing.merged_with(&record)),
            None => Arc::new(record),
        };
        self.records.insert(identity, Arc::clone(&stored));
        stored
    }

    /// Flag that a registration was refused. Entry-point code cannot report
    /// failure synchronously to the loader, so the flag is read back after
    /// the module's registration has run.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take every record out of the sink.
    pub fn drain(&mut self) -> Vec<Arc<PluginRecord>> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    /// Copy the current records without clearing the sink.
    pub fn snapshot(&self) -> Vec<Arc<PluginRecord>> {
        self.records.values().cloned().collect()
    }
}

/// Plugins compiled directly into the host application. Populated once during
/// startup; every loader instance imports these on construction.
static NATIVE: Lazy<Mutex<RegistrationSink>> = Lazy::new(|| Mutex::new(RegistrationSink::new()));

/// Run `f` with exclusive access to the native sink.
pub fn with_native_sink<R>(f: impl FnOnce(&mut RegistrationSink) -> R) -> R {
    let mut sink = NATIVE.lock();
    f(&mut sink)
}

/// The records of every host-linked plugin registered so far.
pub fn native_records() -> Vec<Arc<PluginRecord>> {
    NATIVE.lock().snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Widget;

    #[test]
    fn insert_merges_duplicate_identities() {
        let mut sink = RegistrationSink::new();
        sink.insert(PluginRecord::builder::<Widget>().alias("one").build());
        let merged = sink.insert(PluginRecord::builder::<Widget>().alias("two").build());

        assert!(merged.aliases().contains("one"));
        assert!(merged.aliases().contains("two"));
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn drain_empties_the_sink() {
        let mut sink = RegistrationSink::new();
        sink.insert(PluginRecord::builder::<Widget>().build());
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }
}
