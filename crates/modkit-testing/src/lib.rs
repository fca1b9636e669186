//! Shared fixtures for exercising the plugin loader.
//!
//! This crate provides an in-process [`FakeBackend`] that stands in for the
//! platform module loader, plus a handful of small interface traits and
//! plugin types used across the workspace's tests and the smoke module.

pub mod fake;

use std::any;

use modkit_core::instance::{instance_aware_identity, InstanceAware, PluginInstance, WeakPluginInstance};
use modkit_core::{interface_cast, PluginRecord};

pub use fake::{FakeBackend, FakeModule};

/// A counting test interface.
pub trait Tally {
    fn increment(&mut self);
    fn value(&self) -> u64;
}

/// A labelling test interface.
pub trait Labelled {
    fn label(&self) -> String;
}

/// Read-back side of the instance back-reference capability.
pub trait SelfProbe {
    fn held_instance(&self) -> Option<PluginInstance>;
}

/// Plugin type implementing [`Tally`].
#[derive(Default)]
pub struct Counter {
    hits: u64,
}

impl Tally for Counter {
    fn increment(&mut self) {
        self.hits += 1;
    }

    fn value(&self) -> u64 {
        self.hits
    }
}

/// Plugin type implementing [`Labelled`].
#[derive(Default)]
pub struct Banner;

impl Labelled for Banner {
    fn label(&self) -> String {
        "banner".to_string()
    }
}

/// Plugin type that accepts the loader's instance back-reference.
#[derive(Default)]
pub struct Reflective {
    instance: Option<WeakPluginInstance>,
}

impl InstanceAware for Reflective {
    fn attach_instance(&mut self, instance: &PluginInstance) {
        self.instance = Some(instance.downgrade());
    }
}

impl SelfProbe for Reflective {
    fn held_instance(&self) -> Option<PluginInstance> {
        self.instance.as_ref()?.upgrade()
    }
}

/// A ready-made record for [`Counter`], aliased `"counter"`.
pub fn counter_record() -> PluginRecord {
    PluginRecord::builder::<Counter>()
        .interface(
            any::type_name::<dyn Tally>(),
            interface_cast!(Counter, dyn Tally),
        )
        .alias("counter")
        .build()
}

/// A ready-made record for [`Banner`], aliased `"banner"`.
pub fn banner_record() -> PluginRecord {
    PluginRecord::builder::<Banner>()
        .interface(
            any::type_name::<dyn Labelled>(),
            interface_cast!(Banner, dyn Labelled),
        )
        .alias("banner")
        .build()
}

/// A ready-made record for [`Reflective`], declaring the back-reference
/// capability alongside its probe interface.
pub fn reflective_record() -> PluginRecord {
    PluginRecord::builder::<Reflective>()
        .interface(
            instance_aware_identity(),
            interface_cast!(Reflective, dyn InstanceAware),
        )
        .interface(
            any::type_name::<dyn SelfProbe>(),
            interface_cast!(Reflective, dyn SelfProbe),
        )
        .build()
}

/// Install a test subscriber once; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
