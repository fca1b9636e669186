//! Example modkit module.
//!
//! A minimal loadable module showing how to declare plugins with the SDK.
//! Build it as a cdylib and point a `Loader` at the artifact:
//!
//! ```text
//! cargo build --manifest-path demos/example-module/Cargo.toml
//! ```
//!
//! The host can then load it, look the plugins up by name or alias, and
//! instantiate them through the interfaces they declare.

use modkit_sdk::prelude::*;

/// Interface the host queries: anything that can greet.
pub trait Greet {
    fn greeting(&self, who: &str) -> String;
}

/// Interface for plugins that keep a running total.
pub trait Accumulate {
    fn add(&mut self, amount: i64);
    fn total(&self) -> i64;
}

/// Greets in plain English.
#[derive(Default)]
pub struct EnglishGreeter;

impl Greet for EnglishGreeter {
    fn greeting(&self, who: &str) -> String {
        format!("Hello, {who}!")
    }
}

/// Sums whatever it is fed.
#[derive(Default)]
pub struct RunningTotal {
    sum: i64,
}

impl Accumulate for RunningTotal {
    fn add(&mut self, amount: i64) {
        self.sum += amount;
    }

    fn total(&self) -> i64 {
        self.sum
    }
}

modkit_module! {
    plugin EnglishGreeter: [dyn Greet], aliases: ["greeter", "english"];
    plugin RunningTotal: [dyn Accumulate], aliases: ["total"];
}
