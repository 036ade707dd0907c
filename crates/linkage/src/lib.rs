//! `reclink-linkage`: probabilistic record-linkage engine.
//!
//! Pure engine crate: receives pre-loaded records, returns linked clusters.
//! CSV loading lives in [`load`] so callers can keep I/O outside the pipeline.

pub mod block;
pub mod classify;
pub mod compare;
pub mod config;
pub mod deterministic;
pub mod error;
pub mod estimate;
pub mod evaluate;
pub mod load;
pub mod model;
pub mod normalize;
pub mod persist;
pub mod pipeline;
pub mod resolve;
pub mod synth;

pub use config::LinkConfig;
pub use error::{FieldError, LinkError, LinkWarning};
pub use estimate::{EstimationStatus, FittedModel};
pub use model::{
    LinkCluster, LinkDecision, LinkInput, LinkLabel, LinkResult, ModelParameters, RawRecord,
    Record, Side,
};
pub use persist::PersistedModel;
pub use pipeline::{run, run_with, RunOptions};
