//! Formatting of raw type-identity strings into human-readable names.
//!
//! Identities come from the compiler and are only guaranteed stable within a
//! single binary. Everything user-facing goes through [`display_name`], so the
//! formatting policy can change without touching lookup semantics.

/// Turn a raw type identity into the name used for lookups and display.
///
/// Trait-object identities carry a `dyn ` prefix that adds nothing for a
/// human reader; it is stripped here.
pub fn display_name(identity: &str) -> String {
    identity.trim().trim_start_matches("dyn ").to_string()
}

/// The last path segment of an identity, with generic arguments stripped.
pub fn short_name(identity: &str) -> &str {
    let no_generics = identity.split('<').next().unwrap_or(identity);
    no_generics.rsplit("::").next().unwrap_or(no_generics).trim()
}

/// The exported marker symbol expected for a host-linked plugin type.
///
/// Modules built with the registration macro export one such symbol per
/// plugin. Looking these up in a freshly opened module is how the loader
/// recognizes a library whose plugins were already registered at link time.
/// The derivation is a naming convention, not an ABI guarantee; foreign
/// modules simply produce no matches.
pub fn marker_symbol(identity: &str) -> String {
    format!("modkit_marker_{}", short_name(identity))
}
