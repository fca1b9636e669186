//! Plugin records: the metadata a module hands to the host for each
//! instantiable plugin type.
//!
//! A record is immutable once built and is shared by reference counting
//! between every loader that imports it. Its factory and destroyer execute
//! code inside the module that produced the record, so a record must never
//! outlive the mapping of its owning module.

use std::any;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::mem;
use std::ptr;

use crate::format;
use crate::handshake::LegacyRecord;

/// Constructs a new opaque plugin instance.
pub type FactoryFn = unsafe extern "C" fn() -> *mut c_void;

/// Releases an instance produced by the matching [`FactoryFn`].
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Maps an opaque instance pointer to one of the interfaces it implements.
pub type InterfaceCastFn = unsafe extern "C" fn(*mut c_void) -> InterfaceRef;

/// An opaque interface pointer.
///
/// Trait-object pointers are two words wide, so a single `*mut c_void` cannot
/// carry them across the registration boundary. This type is wide enough for
/// both thin and fat pointers; [`InterfaceRef::from_pointer`] zero-fills the
/// second word for thin pointers so equality stays well defined.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterfaceRef {
    data: *mut c_void,
    meta: *mut c_void,
}

impl InterfaceRef {
    /// Pack a raw pointer (thin or fat) into an opaque reference.
    ///
    /// # Safety
    /// `P` must be a pointer type of at most two words. The value is stored
    /// bitwise and can only be recovered through [`InterfaceRef::cast`] with
    /// the same pointer type.
    pub unsafe fn from_pointer<P: Copy>(pointer: P) -> Self {
        assert!(mem::size_of::<P>() <= mem::size_of::<Self>());
        let mut packed = Self {
            data: ptr::null_mut(),
            meta: ptr::null_mut(),
        };
        unsafe {
            ptr::copy_nonoverlapping(
                (&pointer as *const P).cast::<u8>(),
                (&mut packed as *mut Self).cast::<u8>(),
                mem::size_of::<P>(),
            );
        }
        packed
    }

    /// Recover the pointer packed by [`InterfaceRef::from_pointer`].
    ///
    /// # Safety
    /// `P` must be the exact pointer type this reference was packed from.
    pub unsafe fn cast<P: Copy>(self) -> P {
        assert!(mem::size_of::<P>() <= mem::size_of::<Self>());
        unsafe { ptr::read((&self as *const Self).cast::<P>()) }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }
}

/// Produce an [`InterfaceCastFn`] for a concrete plugin type and one of the
/// interfaces it implements.
///
/// ```ignore
/// let cast = interface_cast!(Counter, dyn Tally);
/// ```
#[macro_export]
macro_rules! interface_cast {
    ($plugin:ty, $interface:ty) => {{
        unsafe extern "C" fn cast(raw: *mut ::core::ffi::c_void) -> $crate::record::InterfaceRef {
            let object: *mut $interface = raw as *mut $plugin;
            unsafe { $crate::record::InterfaceRef::from_pointer(object) }
        }
        cast as $crate::record::InterfaceCastFn
    }};
}

/// Default factory for plugin types constructible with [`Default`].
pub unsafe extern "C" fn construct_default<T: Default>() -> *mut c_void {
    Box::into_raw(Box::new(T::default())).cast::<c_void>()
}

/// Destroyer paired with [`construct_default`].
pub unsafe extern "C" fn destroy_boxed<T>(raw: *mut c_void) {
    drop(unsafe { Box::from_raw(raw.cast::<T>()) });
}

/// Metadata describing one instantiable plugin type.
pub struct PluginRecord {
    identity: String,
    name: String,
    aliases: BTreeSet<String>,
    interfaces: BTreeMap<String, InterfaceCastFn>,
    display_interfaces: BTreeSet<String>,
    factory: FactoryFn,
    destroyer: DestroyFn,
}

impl PluginRecord {
    /// Start building a record for `T`, using `T`'s compiler-assigned type
    /// identity and a boxed `Default` factory.
    pub fn builder<T: Default + 'static>() -> RecordBuilder {
        RecordBuilder::new(
            any::type_name::<T>(),
            construct_default::<T>,
            destroy_boxed::<T>,
        )
    }

    /// Start building a record from an explicit identity and construction
    /// pair, for callers with their own identity scheme.
    pub fn builder_raw(
        identity: impl Into<String>,
        factory: FactoryFn,
        destroyer: DestroyFn,
    ) -> RecordBuilder {
        RecordBuilder::new(identity, factory, destroyer)
    }

    pub(crate) fn from_legacy(legacy: &LegacyRecord) -> Self {
        let display_interfaces = legacy
            .interfaces
            .keys()
            .map(|identity| format::display_name(identity))
            .collect();
        Self {
            name: format::display_name(&legacy.identity),
            identity: legacy.identity.clone(),
            aliases: legacy.aliases.clone(),
            interfaces: legacy.interfaces.clone(),
            display_interfaces,
            factory: legacy.factory,
            destroyer: legacy.destroyer,
        }
    }

    /// Union this record with another registration of the same identity.
    ///
    /// A plugin type may be registered more than once with different alias or
    /// interface declarations; the merged record carries all of them.
    pub(crate) fn merged_with(&self, other: &PluginRecord) -> PluginRecord {
        let mut merged = PluginRecord {
            identity: self.identity.clone(),
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            interfaces: self.interfaces.clone(),
            display_interfaces: self.display_interfaces.clone(),
            factory: self.factory,
            destroyer: self.destroyer,
        };
        merged.aliases.extend(other.aliases.iter().cloned());
        for (identity, cast) in &other.interfaces {
            merged.interfaces.entry(identity.clone()).or_insert(*cast);
            merged
                .display_interfaces
                .insert(format::display_name(identity));
        }
        merged
    }

    /// Raw type identity; the registration dedup key.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Human-readable name; the lookup key inside a loader.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &BTreeSet<String> {
        &self.aliases
    }

    pub fn interfaces(&self) -> &BTreeMap<String, InterfaceCastFn> {
        &self.interfaces
    }

    pub fn display_interfaces(&self) -> &BTreeSet<String> {
        &self.display_interfaces
    }

    pub fn implements(&self, interface_identity: &str) -> bool {
        self.interfaces.contains_key(interface_identity)
    }

    pub fn implements_displayed(&self, interface_name: &str) -> bool {
        self.display_interfaces.contains(interface_name)
    }

    pub fn factory(&self) -> FactoryFn {
        self.factory
    }

    pub fn destroyer(&self) -> DestroyFn {
        self.destroyer
    }

    /// Apply the cast function registered for `interface_identity` to an
    /// instance produced by this record's factory.
    ///
    /// # Safety
    /// `instance` must be a live pointer obtained from this record's factory,
    /// and the owning module must still be loaded.
    pub unsafe fn cast(&self, interface_identity: &str, instance: *mut c_void) -> Option<InterfaceRef> {
        let cast = self.interfaces.get(interface_identity)?;
        Some(unsafe { cast(instance) })
    }
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("interfaces", &self.display_interfaces)
            .finish()
    }
}

/// Builder assembling a [`PluginRecord`] from explicit parts.
pub struct RecordBuilder {
    identity: String,
    name: Option<String>,
    aliases: BTreeSet<String>,
    interfaces: BTreeMap<String, InterfaceCastFn>,
    factory: FactoryFn,
    destroyer: DestroyFn,
}

impl RecordBuilder {
    fn new(identity: impl Into<String>, factory: FactoryFn, destroyer: DestroyFn) -> Self {
        Self {
            identity: identity.into(),
            name: None,
            aliases: BTreeSet::new(),
            interfaces: BTreeMap::new(),
            factory,
            destroyer,
        }
    }

    /// Override the display name derived from the identity.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a lookup alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    /// Declare an implemented interface as an (identity, cast) pair.
    pub fn interface(mut self, interface_identity: impl Into<String>, cast: InterfaceCastFn) -> Self {
        self.interfaces.insert(interface_identity.into(), cast);
        self
    }

    pub fn build(self) -> PluginRecord {
        let display_interfaces = self
            .interfaces
            .keys()
            .map(|identity| format::display_name(identity))
            .collect();
        PluginRecord {
            name: self
                .name
                .unwrap_or_else(|| format::display_name(&self.identity)),
            identity: self.identity,
            aliases: self.aliases,
            interfaces: self.interfaces,
            display_interfaces,
            factory: self.factory,
            destroyer: self.destroyer,
        }
    }
}
