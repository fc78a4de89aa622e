//! Sequential stage/task execution with per-task timing.
//!
//! ```text
//! ExecutionPlan → Stage ("machine", "storage", ...) → Task
//!
//! - Plan: ordered stages, consumed by the executor
//! - Stage: named group of tasks run one after another
//! - Task: atomic unit of work against a shared context
//! ```
//!
//! The first failing task stops the plan. Its error is returned together with
//! the metrics gathered so far.
//!
//! ```ignore
//! let plan = ExecutionPlan::new()
//!     .stage(Stage::new("machine", vec![Box::new(CreateMachineTask)]))
//!     .stage(Stage::new("register", vec![Box::new(RegisterTask)]));
//! let metrics = PipelineExecutor::execute(plan, ctx).await?;
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, PipelineExecutor, PipelineFailure};
pub use stage::Stage;
pub use task::{BoxedTask, PipelineTask};
