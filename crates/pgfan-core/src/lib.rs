pub mod error;
pub mod event;
pub mod glob;
pub mod transform;

pub use error::{Error, Result};
pub use event::{CdcEvent, Op, RowMap, Source, Value, UNCHANGED_TOAST};
pub use glob::Glob;
pub use transform::{
    apply_chain, compile_chain, FilterSpec, ExtractSpec, ReplaceSpec, TransformSpec,
    Transformation,
};
