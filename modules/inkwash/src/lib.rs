//! Article washing pipeline.
//!
//! Fetches a source page, rewrites it through AI stages, and publishes the
//! result as a WeChat draft, with per-channel resumable state.

use anyhow::Result;

pub mod pipeline;
pub mod state;
pub mod steps;

pub use pipeline::{Pipeline, PipelineHooks, StepHandler};
pub use state::{PipelineState, PipelineStateStore, StepStatus};
pub use steps::StepContext;

/// The standard pipeline. `title` branches off `translate` so a title can
/// be produced even when formatting fails; `publish` needs both branches.
pub fn build_pipeline() -> Result<Pipeline> {
    let mut pipeline = Pipeline::default();
    pipeline.register("fetch", &[], Box::new(steps::FetchStep))?;
    pipeline.register("translate", &["fetch"], Box::new(steps::TranslateStep))?;
    pipeline.register("format", &["translate"], Box::new(steps::FormatStep))?;
    pipeline.register("title", &["translate"], Box::new(steps::TitleStep))?;
    pipeline.register("publish", &["format", "title"], Box::new(steps::PublishStep))?;
    Ok(pipeline)
}
