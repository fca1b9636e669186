//! Authoring SDK for plugin modules.
//!
//! A module declares its plugins once with [`modkit_module!`]; the macro
//! generates the registration entry point the host resolves at load time, the
//! cleanup hook it calls at unload, and a marker symbol per plugin so a
//! host-linked build of the same module is still recognized.
//!
//! ```ignore
//! use modkit_sdk::prelude::*;
//!
//! #[derive(Default)]
//! pub struct Counter {
//!     hits: u64,
//! }
//!
//! impl Tally for Counter { /* ... */ }
//!
//! modkit_module! {
//!     plugin Counter: [dyn Tally], aliases: ["counter"];
//! }
//! ```

#[macro_use]
mod macros;

use parking_lot::Mutex;

pub use modkit_core::{
    construct_default, destroy_boxed, interface_cast, with_native_registrar, DestroyFn, FactoryFn,
    HostRegistrar, InterfaceCastFn, InterfaceRef, PluginRecord, RecordBuilder, RegistrationToken,
    HOST_ABI_VERSION,
};

/// Common imports for module authors.
pub mod prelude {
    pub use crate::{modkit_module, HostRegistrar, PluginRecord, RecordBuilder};
    pub use modkit_core::interface_cast;
    pub use modkit_core::instance::{InstanceAware, PluginInstance, WeakPluginInstance};
}

/// Tokens for every registration this module has made. Held until the module
/// unloads; the generated exit hook drains them.
static TOKENS: Mutex<Vec<RegistrationToken>> = Mutex::new(Vec::new());

/// Keep a registration token alive until [`release_tokens`] runs.
pub fn stash_token(token: RegistrationToken) {
    TOKENS.lock().push(token);
}

/// Release every stashed registration token. Called from the generated
/// module exit hook, right before the host unmaps the module.
pub fn release_tokens() {
    for token in TOKENS.lock().drain(..) {
        token.release();
    }
}
