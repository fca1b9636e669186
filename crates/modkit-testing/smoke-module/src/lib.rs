//! A small loadable module used to smoke test the loader end to end.

use modkit_sdk::prelude::*;
use modkit_testing::{Labelled, Tally};

/// Counts how often it was poked.
#[derive(Default)]
pub struct SmokeCounter {
    hits: u64,
}

impl Tally for SmokeCounter {
    fn increment(&mut self) {
        self.hits += 1;
    }

    fn value(&self) -> u64 {
        self.hits
    }
}

/// Identifies itself by a fixed label.
#[derive(Default)]
pub struct SmokeBanner;

impl Labelled for SmokeBanner {
    fn label(&self) -> String {
        "smoke".to_string()
    }
}

modkit_module! {
    plugin SmokeCounter: [dyn Tally], aliases: ["smoke.counter", "counter"];
    plugin SmokeBanner: [dyn Labelled], aliases: ["smoke.banner"];
}
