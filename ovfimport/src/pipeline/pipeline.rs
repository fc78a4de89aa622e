//! Plan and executor.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::Stage;
use super::task::BoxedTask;
use ovfimport_shared::errors::ImportError;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Default for ExecutionPlan<Ctx> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Empty stages are dropped.
    pub fn stage(mut self, stage: Stage<BoxedTask<Ctx>>) -> Self {
        if !stage.is_empty() {
            self.stages.push(stage);
        }
        self
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.tasks.len()).sum()
    }
}

/// A failed run: the error of the failing task and what completed before it.
#[derive(Debug)]
pub struct PipelineFailure {
    pub stage: &'static str,
    pub task: String,
    pub error: ImportError,
    pub metrics: PipelineMetrics,
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage of `plan` in order against `ctx`.
    pub async fn execute<Ctx>(
        plan: ExecutionPlan<Ctx>,
        ctx: Ctx,
    ) -> Result<PipelineMetrics, PipelineFailure>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut metrics = PipelineMetrics::default();

        for stage in plan.stages {
            let stage_start = Instant::now();
            let mut stage_metrics = StageMetrics {
                name: stage.name,
                duration_ms: 0,
                tasks: Vec::with_capacity(stage.tasks.len()),
            };

            for task in stage.tasks {
                let name = task.name().to_string();
                let task_start = Instant::now();

                if let Err(error) = task.run(ctx.clone()).await {
                    stage_metrics.duration_ms = stage_start.elapsed().as_millis();
                    metrics.stages.push(stage_metrics);
                    metrics.total_duration_ms = total_start.elapsed().as_millis();
                    return Err(PipelineFailure {
                        stage: stage.name,
                        task: name,
                        error,
                        metrics,
                    });
                }

                stage_metrics.tasks.push(TaskMetrics {
                    name,
                    duration_ms: task_start.elapsed().as_millis(),
                });
            }

            stage_metrics.duration_ms = stage_start.elapsed().as_millis();
            metrics.stages.push(stage_metrics);
        }

        metrics.total_duration_ms = total_start.elapsed().as_millis();
        Ok(metrics)
    }
}
