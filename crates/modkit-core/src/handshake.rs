//! The registration handshake between a module and the host.
//!
//! When a loader opens a module it resolves the module's entry point and
//! calls it with a [`HostRegistrar`]. The module submits one [`PluginRecord`]
//! per plugin type, together with the record size and alignment *as compiled
//! inside the module*. The host refuses any record whose declared layout
//! disagrees with its own compiled layout — that is the only thing standing
//! between a stale module and memory corruption, so it happens before a
//! single field of the record is read.
//!
//! Accepted registrations return an opaque token. The module holds its tokens
//! until it unloads and releases them from its exit hook; releasing a token
//! drops the host-side reference and clears the archive bookkeeping for the
//! module. A module that never releases its tokens leaks bookkeeping but
//! corrupts nothing.
//!
//! Older modules expose a table hook instead: a single function that reports
//! version, record size, and alignment through out-parameters and returns a
//! name-keyed record table. The host validates all three values and imports
//! zero records from the table on any disagreement.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use crate::archive;
use crate::error::PluginError;
use crate::record::{DestroyFn, FactoryFn, InterfaceCastFn, PluginRecord};
use crate::registry::{self, RegistrationSink};

/// Version of the registrar handed to module entry points.
pub const HOST_ABI_VERSION: u32 = 2;

/// Version expected from the legacy table hook.
pub const LEGACY_ABI_VERSION: u32 = 1;

/// Symbol of the primary registration entry point exported by modules.
pub const MODULE_ENTRY_SYMBOL: &str = "modkit_module_entry";

/// Symbol of the module cleanup hook.
pub const MODULE_EXIT_SYMBOL: &str = "modkit_module_exit";

/// Symbol of the legacy table hook.
pub const LEGACY_TABLE_SYMBOL: &str = "modkit_legacy_table";

/// Signature of the primary module entry point.
pub type ModuleEntryFn = unsafe extern "C" fn(*mut HostRegistrar);

/// Signature of the module cleanup hook.
pub type ModuleExitFn = unsafe extern "C" fn();

/// Signature of the legacy table hook.
pub type LegacyTableFn = unsafe extern "C" fn(*mut u32, *mut usize, *mut usize) -> *const LegacyTable;

/// The host's side of the registration handshake.
///
/// Layout-stable by construction: the version field comes first, so a module
/// built against a different registrar revision can read it and back out
/// without touching the rest of the structure.
#[repr(C)]
pub struct HostRegistrar {
    abi_version: u32,
    sink: *mut RegistrationSink,
    register: unsafe extern "C" fn(
        *mut RegistrationSink,
        *mut PluginRecord,
        usize,
        usize,
    ) -> RawRegistrationToken,
}

impl HostRegistrar {
    /// Build a registrar depositing into `sink`. The registrar must not
    /// outlive the sink.
    pub fn for_sink(sink: &mut RegistrationSink) -> Self {
        Self {
            abi_version: HOST_ABI_VERSION,
            sink,
            register: register_record,
        }
    }

    /// Submit a record, measuring its layout on the caller's side of the
    /// boundary. Returns `None` when the host refused the registration or the
    /// registrar revision is unknown to this code.
    pub fn submit(&mut self, record: PluginRecord) -> Option<RegistrationToken> {
        self.submit_raw(
            Box::new(record),
            mem::size_of::<PluginRecord>(),
            mem::align_of::<PluginRecord>(),
        )
    }

    /// Low-level form of [`HostRegistrar::submit`] with the record's layout
    /// measurements supplied by the caller. A marshalling layer that builds
    /// records itself measures them on its own side and submits here. A
    /// refused record is leaked, never read.
    pub fn submit_raw(
        &mut self,
        record: Box<PluginRecord>,
        declared_size: usize,
        declared_align: usize,
    ) -> Option<RegistrationToken> {
        if self.abi_version != HOST_ABI_VERSION {
            return None;
        }
        let raw = unsafe {
            (self.register)(
                self.sink,
                Box::into_raw(record),
                declared_size,
                declared_align,
            )
        };
        RegistrationToken::from_raw(raw)
    }
}

unsafe extern "C" fn register_record(
    sink: *mut RegistrationSink,
    record: *mut PluginRecord,
    declared_size: usize,
    declared_align: usize,
) -> RawRegistrationToken {
    let sink = unsafe { &mut *sink };

    if declared_size != mem::size_of::<PluginRecord>()
        || declared_align != mem::align_of::<PluginRecord>()
    {
        let err = PluginError::AbiMismatch {
            expected_size: mem::size_of::<PluginRecord>(),
            received_size: declared_size,
            expected_align: mem::align_of::<PluginRecord>(),
            received_align: declared_align,
        };
        tracing::error!("refusing plugin registration: {err}");
        sink.mark_failed();
        // The record's layout cannot be trusted, so it is leaked rather than
        // read or freed.
        return RawRegistrationToken::refused();
    }

    let record = unsafe { *Box::from_raw(record) };
    let stored = sink.insert(record);
    RawRegistrationToken {
        record: Arc::into_raw(stored).cast::<c_void>(),
        release: Some(release_record),
    }
}

unsafe extern "C" fn release_record(record: *const c_void) {
    let record = unsafe { Arc::from_raw(record.cast::<PluginRecord>()) };
    archive::forget_record(Arc::as_ptr(&record) as usize);
    drop(record);
}

/// Wire form of a registration token.
#[repr(C)]
pub struct RawRegistrationToken {
    record: *const c_void,
    release: Option<unsafe extern "C" fn(*const c_void)>,
}

impl RawRegistrationToken {
    fn refused() -> Self {
        Self {
            record: ptr::null(),
            release: None,
        }
    }
}

/// Proof of an accepted registration.
///
/// The owning module keeps its tokens alive for as long as it is loaded and
/// calls [`RegistrationToken::release`] from its exit hook. Dropping a token
/// without releasing it keeps the host-side record reference alive forever;
/// harmless, but it defeats the archive's self-cleaning.
pub struct RegistrationToken {
    raw: RawRegistrationToken,
}

// The wrapped pointer is a reference-counted record, which is itself
// shareable across threads; the token only moves between the registering
// thread and the unload path.
unsafe impl Send for RegistrationToken {}

impl RegistrationToken {
    fn from_raw(raw: RawRegistrationToken) -> Option<Self> {
        if raw.record.is_null() {
            return None;
        }
        Some(Self { raw })
    }

    /// Release the host-side reference and the archive bookkeeping for this
    /// registration. The release runs host code through the function pointer
    /// captured at registration time.
    pub fn release(self) {
        if let Some(release) = self.raw.release {
            unsafe { release(self.raw.record) };
        }
    }
}

/// Run `f` against a registrar that deposits into the process-wide native
/// sink. Host-linked plugins register themselves through this during
/// application startup.
pub fn with_native_registrar<R>(f: impl FnOnce(&mut HostRegistrar) -> R) -> R {
    registry::with_native_sink(|sink| {
        let mut registrar = HostRegistrar::for_sink(sink);
        f(&mut registrar)
    })
}

/// A record in the shape the legacy table hook produces: no display name and
/// no pre-formatted interface set.
#[derive(Clone)]
pub struct LegacyRecord {
    pub identity: String,
    pub aliases: BTreeSet<String>,
    pub interfaces: BTreeMap<String, InterfaceCastFn>,
    pub factory: FactoryFn,
    pub destroyer: DestroyFn,
}

/// The table returned by the legacy hook. Owned by the module; only borrowed
/// by the host while the module is mapped.
#[derive(Default)]
pub struct LegacyTable {
    pub records: Vec<LegacyRecord>,
}

/// What a module's legacy hook reported back.
pub struct LegacyReply {
    pub version: u32,
    pub size: usize,
    pub align: usize,
    pub table: *const LegacyTable,
}

/// Validate a legacy reply and convert its records to the current shape.
///
/// Any disagreement on version or layout imports nothing: the error names the
/// expected and received values, and the caller keeps whatever the primary
/// handshake produced.
pub(crate) fn import_legacy(reply: &LegacyReply, path: &Path) -> Result<Vec<PluginRecord>, PluginError> {
    tracing::warn!(
        "the module [{}] is using a deprecated method for registering plugins; \
         please rebuild it against the current host",
        path.display()
    );

    if reply.version != LEGACY_ABI_VERSION {
        return Err(PluginError::LegacyVersionMismatch {
            path: path.to_path_buf(),
            expected: LEGACY_ABI_VERSION,
            received: reply.version,
        });
    }

    if reply.size != mem::size_of::<LegacyRecord>() || reply.align != mem::align_of::<LegacyRecord>()
    {
        return Err(PluginError::AbiMismatch {
            expected_size: mem::size_of::<LegacyRecord>(),
            received_size: reply.size,
            expected_align: mem::align_of::<LegacyRecord>(),
            received_align: reply.align,
        });
    }

    if reply.table.is_null() {
        return Err(PluginError::LegacyTableMissing {
            path: path.to_path_buf(),
        });
    }

    let table = unsafe { &*reply.table };
    Ok(table.records.iter().map(PluginRecord::from_legacy).collect())
}
