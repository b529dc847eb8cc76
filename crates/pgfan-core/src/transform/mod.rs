//! Declarative transformations over [`CdcEvent`]s.
//!
//! A transformation consumes an event and returns it (possibly mutated) or
//! drops it. Chains are applied in declared order; step *n+1* sees the
//! output of step *n*, and a drop anywhere terminates the chain.

mod extract;
mod filter;
mod replace;

pub use extract::{Extract, ExtractSpec};
pub use filter::{Filter, FilterSpec};
pub use replace::{Replace, ReplaceSpec};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::CdcEvent;

/// A transformation as declared in configuration.
///
/// The `template` kind is reserved and not accepted in v1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformSpec {
    Filter(FilterSpec),
    Extract(ExtractSpec),
    Replace(ReplaceSpec),
}

/// A compiled transformation ready to apply.
#[derive(Debug, Clone)]
pub enum Transformation {
    Filter(Filter),
    Extract(Extract),
    Replace(Replace),
}

impl Transformation {
    /// Compile a declared transformation. Glob and regex compilation happens
    /// here, so a bad pattern fails at startup rather than per event.
    pub fn compile(spec: &TransformSpec) -> Result<Self> {
        match spec {
            TransformSpec::Filter(s) => Ok(Transformation::Filter(Filter::compile(s)?)),
            TransformSpec::Extract(s) => Ok(Transformation::Extract(Extract::new(s))),
            TransformSpec::Replace(s) => Ok(Transformation::Replace(Replace::compile(s)?)),
        }
    }

    /// Apply the transformation. `None` means the event was dropped.
    pub fn apply(&self, event: CdcEvent) -> Option<CdcEvent> {
        match self {
            Transformation::Filter(f) => f.apply(event),
            Transformation::Extract(e) => Some(e.apply(event)),
            Transformation::Replace(r) => Some(r.apply(event)),
        }
    }
}

/// Compile a declared chain in order.
pub fn compile_chain(specs: &[TransformSpec]) -> Result<Vec<Transformation>> {
    specs.iter().map(Transformation::compile).collect()
}

/// Run an event through a compiled chain. A drop at any step produces no
/// output.
pub fn apply_chain(chain: &[Transformation], event: CdcEvent) -> Option<CdcEvent> {
    let mut current = event;
    for step in chain {
        current = step.apply(current)?;
    }
    Some(current)
}
