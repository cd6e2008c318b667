//! Multi-stage handler pipelines.
//!
//! A pipeline is an ordered list of stages over a shared state value. Each
//! stage owns a slice of the 0-100 progress range and the cumulative
//! percentage is reported once the stage finishes. The first failing stage
//! aborts the rest; side effects of earlier stages are left in place.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use docket_core::{Error, Result};

use crate::handler::JobContext;

/// One step of a [`Pipeline`].
#[async_trait]
pub trait Stage<S: Send>: Send + Sync {
    /// Short name; prefixes the job error when this stage fails.
    fn name(&self) -> &'static str;

    /// Run the stage, reading and extending the pipeline state.
    async fn run(&self, state: &mut S) -> Result<()>;
}

/// A stage error, tagged with the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage}: {error}")]
pub struct StageFailure {
    pub stage: String,
    #[source]
    pub error: Error,
}

/// Ordered stages with their cumulative progress percentages.
pub struct Pipeline<S: Send> {
    stages: Vec<(i32, Box<dyn Stage<S>>)>,
}

impl<S: Send> Default for Pipeline<S> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<S: Send> Pipeline<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage that ends at `end_percent` progress.
    pub fn stage(mut self, end_percent: i32, stage: impl Stage<S> + 'static) -> Self {
        self.stages.push((end_percent.clamp(0, 100), Box::new(stage)));
        self
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(_, s)| s.name()).collect()
    }

    /// Run every stage in order. Progress is reported to `ctx` when given.
    pub async fn run(
        &self,
        state: &mut S,
        ctx: Option<&JobContext>,
    ) -> std::result::Result<(), StageFailure> {
        for (end_percent, stage) in &self.stages {
            let start = Instant::now();

            if let Err(error) = stage.run(state).await {
                warn!(
                    stage = stage.name(),
                    error = %error,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Pipeline stage failed"
                );
                return Err(StageFailure {
                    stage: stage.name().to_string(),
                    error,
                });
            }

            debug!(
                stage = stage.name(),
                progress = *end_percent,
                duration_ms = start.elapsed().as_millis() as u64,
                "Pipeline stage complete"
            );

            if let Some(ctx) = ctx {
                ctx.report_progress(*end_percent, Some(stage.name())).await;
            }
        }
        Ok(())
    }
}
