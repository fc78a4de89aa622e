//! Task trait.

use async_trait::async_trait;
use ovfimport_shared::errors::ImportResult;

/// Unit of work in a pipeline.
///
/// Tasks receive a clone of the shared context; use interior mutability for
/// anything a later task needs to see.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> ImportResult<()>;

    /// Name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
