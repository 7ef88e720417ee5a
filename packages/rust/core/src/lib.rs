//! Core pipeline orchestration and domain logic for PartGen.
//!
//! This crate ties together the specification index, column resolution,
//! prompt construction, generation and response parsing into the bulk and
//! single-item workflows exposed by [`Pipeline`].

pub mod generation;
pub mod merge;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod schema;
pub mod spec_index;
pub mod title;

#[cfg(test)]
mod testing;

pub use generation::{GenerationFailure, GenerationOutcome, Generator, RetryPolicy};
pub use pipeline::{InspectReport, Pipeline, RunSummary, SpecLookupCheck, StructureReport};
pub use scheduler::{PipelineEvent, PipelineObserver, SilentObserver};
pub use schema::TableProfile;
pub use spec_index::SpecIndex;
