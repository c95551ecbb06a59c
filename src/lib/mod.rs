pub mod aggregate;
pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use error::{RebuildError, Result};
pub use pipeline::{PipelineOptions, PipelineState, RebuildPipeline, RebuildReport};
