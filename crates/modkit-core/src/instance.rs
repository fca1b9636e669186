//! Live plugin instances and the wrapper that keeps their module mapped.

use std::any;
use std::ffi::c_void;
use std::sync::{Arc, Weak};

use crate::handle::LibraryHandle;
use crate::record::{InterfaceRef, PluginRecord};

struct InstanceCore {
    raw: *mut c_void,
    record: Option<Arc<PluginRecord>>,
    handle: Option<Arc<LibraryHandle>>,
}

impl InstanceCore {
    fn record(&self) -> &Arc<PluginRecord> {
        self.record
            .as_ref()
            .expect("instance record is present until teardown")
    }
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        // Teardown order is load-bearing: the destroyer executes module
        // code, and the record must be gone before the handle it depends on.
        if let Some(record) = self.record.take() {
            unsafe { (record.destroyer())(self.raw) };
        }
        self.handle.take();
    }
}

/// A shared handle to one plugin instance.
///
/// The wrapper binds the opaque instance pointer to the record that produced
/// it and to the library handle of the owning module. As long as any clone of
/// the wrapper is alive, the module stays mapped; when the last clone goes,
/// the instance is destroyed first and the module reference released second.
///
/// Instances are not synchronized; keep a wrapper on one thread or add your
/// own locking around it.
#[derive(Clone)]
pub struct PluginInstance {
    core: Arc<InstanceCore>,
}

impl PluginInstance {
    pub(crate) fn new(
        raw: *mut c_void,
        record: Arc<PluginRecord>,
        handle: Option<Arc<LibraryHandle>>,
    ) -> Self {
        Self {
            core: Arc::new(InstanceCore {
                raw,
                record: Some(record),
                handle,
            }),
        }
    }

    /// The resolved name of the plugin this instance came from.
    pub fn name(&self) -> &str {
        self.core.record().name()
    }

    pub fn record(&self) -> &Arc<PluginRecord> {
        self.core.record()
    }

    /// The opaque instance pointer.
    pub fn raw(&self) -> *mut c_void {
        self.core.raw
    }

    /// Cast the instance to an interface it declares, by raw interface
    /// identity. Returns `None` when the record does not declare it.
    pub fn interface_ref(&self, interface_identity: &str) -> Option<InterfaceRef> {
        unsafe { self.core.record().cast(interface_identity, self.core.raw) }
    }

    /// Typed access to a declared interface.
    ///
    /// # Safety
    /// `I` must be the exact trait-object type the interface was registered
    /// with, and the caller must not hold any other reference into the
    /// instance while the returned borrow is alive.
    pub unsafe fn interface_mut<I: ?Sized + 'static>(&self) -> Option<&mut I> {
        let packed = self.interface_ref(any::type_name::<I>())?;
        let pointer: *mut I = unsafe { packed.cast() };
        unsafe { pointer.as_mut() }
    }

    pub fn downgrade(&self) -> WeakPluginInstance {
        WeakPluginInstance {
            core: Arc::downgrade(&self.core),
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("plugin", &self.name())
            .finish()
    }
}

/// A non-owning reference to a plugin instance.
#[derive(Clone)]
pub struct WeakPluginInstance {
    core: Weak<InstanceCore>,
}

impl WeakPluginInstance {
    pub fn upgrade(&self) -> Option<PluginInstance> {
        self.core.upgrade().map(|core| PluginInstance { core })
    }
}

/// Well-known capability: a plugin that wants a handle to its own wrapper.
///
/// Declare `dyn InstanceAware` like any other interface; the loader notices
/// it right after construction and injects a weak back-reference before the
/// instance is handed to the caller.
pub trait InstanceAware {
    fn attach_instance(&mut self, instance: &PluginInstance);
}

/// Interface identity under which [`InstanceAware`] is declared.
pub fn instance_aware_identity() -> &'static str {
    any::type_name::<dyn InstanceAware>()
}
