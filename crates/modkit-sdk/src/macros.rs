//! The module declaration macro.

/// Declare the plugins a module provides.
///
/// Each `plugin` line names a local plugin type (it must implement
/// [`Default`]), the interfaces it exposes, and optionally a list of lookup
/// aliases. Interfaces are declared as the exact trait-object types callers
/// will query with.
///
/// One invocation per module: the macro generates the module's registration
/// entry point (`modkit_module_entry`), its cleanup hook
/// (`modkit_module_exit`), one marker symbol per plugin, and two plain
/// functions — `modkit_register_with` for registering against an explicit
/// registrar and `modkit_register_builtin` for builds that link the module
/// into the host directly.
///
/// ```ignore
/// modkit_module! {
///     plugin Counter: [dyn Tally], aliases: ["counter", "c"];
///     plugin Banner: [dyn Labelled];
/// }
/// ```
#[macro_export]
macro_rules! modkit_module {
    ($(
        plugin $plugin:ident : [ $( $interface:ty ),* $(,)? ]
        $( , aliases: [ $( $alias:expr ),* $(,)? ] )? ;
    )+) => {
        /// One record per plugin this module declares.
        pub fn modkit_plugin_records() -> ::std::vec::Vec<$crate::PluginRecord> {
            ::std::vec![
                $(
                    $crate::PluginRecord::builder::<$plugin>()
                        $(
                            .interface(
                                ::std::any::type_name::<$interface>(),
                                $crate::interface_cast!($plugin, $interface),
                            )
                        )*
                        $( $( .alias($alias) )* )?
                        .build(),
                )+
            ]
        }

        /// Submit this module's records through the given registrar.
        pub fn modkit_register_with(registrar: &mut $crate::HostRegistrar) {
            for record in modkit_plugin_records() {
                if let ::std::option::Option::Some(token) = registrar.submit(record) {
                    $crate::stash_token(token);
                }
            }
        }

        /// Register this module's plugins as part of the host application.
        /// Call during host startup when the module is linked in rather than
        /// loaded at runtime.
        pub fn modkit_register_builtin() {
            $crate::with_native_registrar(|registrar| modkit_register_with(registrar));
        }

        #[no_mangle]
        pub extern "C" fn modkit_module_entry(registrar: *mut $crate::HostRegistrar) {
            if registrar.is_null() {
                return;
            }
            let registrar = unsafe { &mut *registrar };
            modkit_register_with(registrar);
        }

        #[no_mangle]
        pub extern "C" fn modkit_module_exit() {
            $crate::release_tokens();
        }

        $(
            const _: () = {
                #[export_name = concat!("modkit_marker_", stringify!($plugin))]
                static MARKER: u8 = 0;
            };
        )+
    };
}
