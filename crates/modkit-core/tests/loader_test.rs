//! Integration tests for the plugin loader.
//!
//! Tests include:
//! - Module loading and record import
//! - Archive short-circuiting across repeated loads and loaders
//! - Handle deduplication and unload-exactly-once behavior
//! - Name and alias resolution, including collisions
//! - Layout validation at the registration boundary
//! - The legacy table protocol
//! - Instantiation, interface casting, and instance lifetime
//! - Explicit module forgetting
//!
//! Everything runs against the in-process [`FakeBackend`]; its open, close,
//! and entry counters make the lifetime properties observable. Tests touching
//! the process-wide native sink are serialized.

use std::any;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::mem;
use std::sync::Arc;

use serial_test::serial;

use modkit_core::handshake::{LegacyRecord, LegacyTable, LEGACY_ABI_VERSION};
use modkit_core::instance::instance_aware_identity;
use modkit_core::{
    construct_default, destroy_boxed, interface_cast, with_native_registrar, Loader, PluginError,
    PluginRecord,
};
use modkit_testing::{
    banner_record, counter_record, init_tracing, reflective_record, Banner, Counter, FakeBackend,
    FakeModule, Labelled, SelfProbe, Tally,
};

fn counter_name() -> String {
    any::type_name::<Counter>().to_string()
}

fn banner_name() -> String {
    any::type_name::<Banner>().to_string()
}

fn loader_over(backend: &Arc<FakeBackend>) -> Loader {
    init_tracing();
    Loader::with_backend(backend.clone())
}

#[test]
fn test_load_module_imports_records() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/pair.so",
        FakeModule::new().with_records(|| vec![counter_record(), banner_record()]),
    );
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/pair.so").unwrap();
    assert!(names.contains(&counter_name()));
    assert!(names.contains(&banner_name()));
    assert_eq!(names.len(), 2);

    assert!(loader.all_plugins().contains(&counter_name()));
    assert_eq!(loader.lookup("counter").unwrap(), counter_name());
    assert_eq!(
        loader.aliases_of_plugin(&counter_name()),
        ["counter".to_string()].into_iter().collect::<BTreeSet<_>>()
    );

    let by_identity = loader.plugins_implementing(any::type_name::<dyn Tally>(), false);
    assert!(by_identity.contains(&counter_name()));
    assert!(!by_identity.contains(&banner_name()));

    // Display names drop the `dyn ` prefix.
    let displayed = loader.plugins_implementing("modkit_testing::Labelled", true);
    assert!(displayed.contains(&banner_name()));
}

#[test]
fn test_loading_twice_reuses_the_handle_and_the_archive() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/twice.so",
        FakeModule::new().with_records(|| vec![counter_record()]),
    );
    let mut loader = loader_over(&backend);

    let first = loader.load_module("mods/twice.so").unwrap();
    let second = loader.load_module("mods/twice.so").unwrap();
    assert_eq!(first, second);

    // The module's registration ran once; the second load was answered from
    // the archive.
    assert_eq!(backend.entry_runs("mods/twice.so"), 1);

    // The duplicate platform open was undone immediately.
    assert_eq!(backend.open_count("mods/twice.so"), 2);
    assert_eq!(backend.close_count("mods/twice.so"), 1);
    assert!(backend.is_live("mods/twice.so"));

    drop(loader);
    assert!(!backend.is_live("mods/twice.so"));
    assert_eq!(backend.exit_runs("mods/twice.so"), 1);
}

#[test]
fn test_second_loader_imports_without_rerunning_registration() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/shared.so",
        FakeModule::new().with_records(|| vec![counter_record()]),
    );

    let mut first = loader_over(&backend);
    let names = first.load_module("mods/shared.so").unwrap();

    let mut second = loader_over(&backend);
    let again = second.load_module("mods/shared.so").unwrap();

    assert_eq!(names, again);
    assert_eq!(backend.entry_runs("mods/shared.so"), 1);

    // The module stays mapped until the last loader lets go.
    drop(first);
    assert!(backend.is_live("mods/shared.so"));
    drop(second);
    assert!(!backend.is_live("mods/shared.so"));
    assert_eq!(backend.exit_runs("mods/shared.so"), 1);
}

#[test]
fn test_instance_keeps_the_module_mapped_after_forget() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/held.so",
        FakeModule::new().with_records(|| vec![counter_record()]),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/held.so").unwrap();

    let instance = loader.instantiate("counter").unwrap();

    assert!(loader.forget_module_of_plugin(&counter_name()));
    assert!(!loader.all_plugins().contains(&counter_name()));
    assert!(loader.lookup("counter").is_err());

    // The live instance still pins the module.
    assert!(backend.is_live("mods/held.so"));

    drop(instance);
    assert!(!backend.is_live("mods/held.so"));
    assert_eq!(backend.exit_runs("mods/held.so"), 1);
}

#[test]
fn test_forget_module_by_path() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/forget.so",
        FakeModule::new().with_records(|| vec![counter_record(), banner_record()]),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/forget.so").unwrap();

    assert!(loader.forget_module("mods/forget.so"));
    assert!(!loader.all_plugins().contains(&counter_name()));
    assert!(!loader.all_plugins().contains(&banner_name()));
    assert!(loader.plugins_with_alias("counter").is_empty());
    assert!(!backend.is_live("mods/forget.so"));

    // A second forget has nothing left to do.
    assert!(!loader.forget_module("mods/forget.so"));
    assert!(!loader.forget_module("mods/never-loaded.so"));
}

#[derive(Default)]
struct HostGauge;

trait Gauge {
    fn reading(&self) -> i32;
}

impl Gauge for HostGauge {
    fn reading(&self) -> i32 {
        41
    }
}

#[test]
#[serial]
fn test_native_plugins_cannot_be_forgotten() {
    with_native_registrar(|registrar| {
        registrar.submit(
            PluginRecord::builder::<HostGauge>()
                .interface(
                    any::type_name::<dyn Gauge>(),
                    interface_cast!(HostGauge, dyn Gauge),
                )
                .alias("gauge")
                .build(),
        )
    });

    let backend = Arc::new(FakeBackend::new());
    let mut loader = loader_over(&backend);
    let name = any::type_name::<HostGauge>().to_string();

    assert!(loader.all_plugins().contains(&name));
    assert!(!loader.forget_module_of_plugin(&name));
    assert!(!loader.forget_module_of_plugin("gauge"));
    assert!(loader.all_plugins().contains(&name));

    // Host-linked plugins instantiate like any other.
    let instance = loader.instantiate("gauge").unwrap();
    let gauge = unsafe { instance.interface_mut::<dyn Gauge>() }.unwrap();
    assert_eq!(gauge.reading(), 41);
}

#[derive(Default)]
struct HostBeacon;

#[test]
#[serial]
fn test_statically_linked_module_is_recognized_by_marker() {
    with_native_registrar(|registrar| {
        registrar.submit(PluginRecord::builder::<HostBeacon>().build())
    });

    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/linked-in.so",
        FakeModule::new().with_symbol("modkit_marker_HostBeacon"),
    );
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/linked-in.so").unwrap();
    assert_eq!(
        names,
        [any::type_name::<HostBeacon>().to_string()]
            .into_iter()
            .collect::<BTreeSet<_>>()
    );
}

#[test]
fn test_open_failure_is_an_error() {
    let backend = Arc::new(FakeBackend::new());
    backend.install("mods/broken.so", FakeModule::new().failing("permission denied"));
    let mut loader = loader_over(&backend);

    assert!(matches!(
        loader.load_module("mods/broken.so"),
        Err(PluginError::OpenFailed { .. })
    ));
    assert!(matches!(
        loader.load_module("mods/missing.so"),
        Err(PluginError::OpenFailed { .. })
    ));
}

#[test]
fn test_module_providing_nothing_yields_an_empty_set() {
    let backend = Arc::new(FakeBackend::new());
    backend.install("mods/empty.so", FakeModule::new());
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/empty.so").unwrap();
    assert!(names.is_empty());
}

#[test]
fn test_mismatched_record_is_dropped_but_siblings_import() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/skewed.so",
        FakeModule::new().with_entry(|registrar| {
            let mut tokens = Vec::new();
            tokens.extend(registrar.submit(counter_record()));

            // A record whose declared size disagrees with the host's must
            // never reach a registry.
            let refused = registrar.submit_raw(
                Box::new(banner_record()),
                mem::size_of::<PluginRecord>() + 8,
                mem::align_of::<PluginRecord>(),
            );
            assert!(refused.is_none());
            tokens
        }),
    );
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/skewed.so").unwrap();
    assert_eq!(names, [counter_name()].into_iter().collect::<BTreeSet<_>>());
    assert!(loader.lookup(&banner_name()).is_err());
}

#[derive(Default)]
struct Gizmo;

impl Labelled for Gizmo {
    fn label(&self) -> String {
        "gizmo".to_string()
    }
}

fn gizmo_legacy_table() -> LegacyTable {
    let mut interfaces = BTreeMap::new();
    interfaces.insert(
        any::type_name::<dyn Labelled>().to_string(),
        interface_cast!(Gizmo, dyn Labelled),
    );
    LegacyTable {
        records: vec![LegacyRecord {
            identity: any::type_name::<Gizmo>().to_string(),
            aliases: ["gizmo".to_string()].into_iter().collect(),
            interfaces,
            factory: construct_default::<Gizmo>,
            destroyer: destroy_boxed::<Gizmo>,
        }],
    }
}

#[test]
fn test_legacy_table_imports_after_validation() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/legacy.so",
        FakeModule::new().with_legacy(
            LEGACY_ABI_VERSION,
            mem::size_of::<LegacyRecord>(),
            mem::align_of::<LegacyRecord>(),
            gizmo_legacy_table(),
        ),
    );
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/legacy.so").unwrap();
    let gizmo = any::type_name::<Gizmo>().to_string();
    assert_eq!(names, [gizmo.clone()].into_iter().collect::<BTreeSet<_>>());
    assert_eq!(loader.lookup("gizmo").unwrap(), gizmo);

    let instance = loader.instantiate("gizmo").unwrap();
    let labelled = unsafe { instance.interface_mut::<dyn Labelled>() }.unwrap();
    assert_eq!(labelled.label(), "gizmo");
}

#[test]
fn test_legacy_version_skew_imports_no_legacy_records() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/mixed.so",
        FakeModule::new()
            .with_records(|| vec![counter_record()])
            .with_legacy(
                LEGACY_ABI_VERSION + 1,
                mem::size_of::<LegacyRecord>(),
                mem::align_of::<LegacyRecord>(),
                gizmo_legacy_table(),
            ),
    );
    let mut loader = loader_over(&backend);

    // The whole legacy table is distrusted; the current handshake still
    // imports.
    let names = loader.load_module("mods/mixed.so").unwrap();
    assert_eq!(names, [counter_name()].into_iter().collect::<BTreeSet<_>>());
}

#[test]
fn test_legacy_layout_skew_imports_no_legacy_records() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/stale.so",
        FakeModule::new().with_legacy(
            LEGACY_ABI_VERSION,
            mem::size_of::<LegacyRecord>() + 16,
            mem::align_of::<LegacyRecord>(),
            gizmo_legacy_table(),
        ),
    );
    let mut loader = loader_over(&backend);

    let names = loader.load_module("mods/stale.so").unwrap();
    assert!(names.is_empty());
}

#[test]
fn test_alias_resolution_and_collisions() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/colliding.so",
        FakeModule::new().with_records(|| {
            vec![
                PluginRecord::builder::<Counter>()
                    .interface(
                        any::type_name::<dyn Tally>(),
                        interface_cast!(Counter, dyn Tally),
                    )
                    .alias("dup")
                    .build(),
                PluginRecord::builder::<Banner>()
                    .interface(
                        any::type_name::<dyn Labelled>(),
                        interface_cast!(Banner, dyn Labelled),
                    )
                    .alias("dup")
                    .alias("solo")
                    .build(),
            ]
        }),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/colliding.so").unwrap();

    assert_eq!(loader.lookup("solo").unwrap(), banner_name());

    match loader.lookup("dup") {
        Err(PluginError::AmbiguousAlias { alias, candidates }) => {
            assert_eq!(alias, "dup");
            assert!(candidates.contains(&counter_name()));
            assert!(candidates.contains(&banner_name()));
        }
        other => panic!("expected an ambiguous alias failure, got {other:?}"),
    }

    let claimants = loader.plugins_with_alias("dup");
    assert!(claimants.contains(&counter_name()));
    assert!(claimants.contains(&banner_name()));

    assert!(matches!(
        loader.lookup("no-such-plugin"),
        Err(PluginError::NotFound(_))
    ));
}

#[test]
fn test_exact_name_wins_over_an_alias() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/shadowed.so",
        FakeModule::new().with_records(|| {
            vec![
                counter_record(),
                // Banner claims Counter's own name as an alias; the name must
                // still resolve to Counter.
                PluginRecord::builder::<Banner>()
                    .alias(any::type_name::<Counter>())
                    .build(),
            ]
        }),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/shadowed.so").unwrap();

    assert_eq!(loader.lookup(&counter_name()).unwrap(), counter_name());
}

#[test]
fn test_instantiate_casts_round_trip() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/tally.so",
        FakeModule::new().with_records(|| vec![counter_record()]),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/tally.so").unwrap();

    let instance = loader.instantiate("counter").unwrap();
    let tally = unsafe { instance.interface_mut::<dyn Tally>() }.unwrap();
    tally.increment();
    tally.increment();
    assert_eq!(tally.value(), 2);

    // Casting back through the registered interface lands on the original
    // instance address.
    let packed = instance
        .interface_ref(any::type_name::<dyn Tally>())
        .unwrap();
    let object: *mut dyn Tally = unsafe { packed.cast() };
    assert_eq!(object as *mut c_void, instance.raw());

    // An undeclared interface yields nothing.
    assert!(instance
        .interface_ref(any::type_name::<dyn Labelled>())
        .is_none());
}

#[test]
fn test_instantiate_injects_the_instance_back_reference() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/reflective.so",
        FakeModule::new().with_records(|| vec![reflective_record()]),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/reflective.so").unwrap();

    let instance = loader.instantiate(any::type_name::<modkit_testing::Reflective>()).unwrap();
    assert!(instance.record().implements(instance_aware_identity()));

    let probe = unsafe { instance.interface_mut::<dyn SelfProbe>() }.unwrap();
    let held = probe.held_instance().expect("back-reference was injected");
    assert_eq!(held.raw(), instance.raw());

    // The back-reference is weak; it must not keep the instance alive.
    drop(held);
    let weak = instance.downgrade();
    drop(instance);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_summary_and_pretty_string_surface_collisions() {
    let backend = Arc::new(FakeBackend::new());
    backend.install(
        "mods/report.so",
        FakeModule::new().with_records(|| {
            vec![
                PluginRecord::builder::<Counter>()
                    .interface(
                        any::type_name::<dyn Tally>(),
                        interface_cast!(Counter, dyn Tally),
                    )
                    .alias("shared")
                    .build(),
                PluginRecord::builder::<Banner>().alias("shared").build(),
            ]
        }),
    );
    let mut loader = loader_over(&backend);
    loader.load_module("mods/report.so").unwrap();

    let summary = loader.summary();
    assert!(summary.alias_collisions.contains_key("shared"));
    assert!(summary
        .plugins
        .iter()
        .any(|plugin| plugin.name == counter_name()));

    let json = serde_json::to_string(&summary).unwrap();
    assert!(json.contains("shared"));

    let pretty = loader.pretty_string();
    assert!(pretty.contains(&counter_name()));
    assert!(pretty.contains("[shared] collides between:"));
}
