//! Phase handlers: how each phase checks eligibility and dispatches.

mod destroy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::model::Phase;
use crate::pipeline::ExecutionContext;
use crate::task::ActivityTask;

pub use destroy::DestroyPhaseHandler;

#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Whether the task may run now. `false` skips the stage.
    async fn pre_handle(
        &self,
        task: &ActivityTask,
        ctx: &ExecutionContext,
    ) -> Result<bool, EngineError>;

    /// Start dispatch on the shared scheduler and return immediately; the
    /// outcome arrives on the task's completion signal.
    fn handle(&self, task: &Arc<ActivityTask>, ctx: &ExecutionContext);
}

/// Prepare, attack and status: the task's own lifecycle as is.
#[derive(Debug, Default)]
pub struct DefaultPhaseHandler;

#[async_trait]
impl PhaseHandler for DefaultPhaseHandler {
    async fn pre_handle(
        &self,
        task: &ActivityTask,
        ctx: &ExecutionContext,
    ) -> Result<bool, EngineError> {
        task.pre_handle(ctx).await
    }

    fn handle(&self, task: &Arc<ActivityTask>, ctx: &ExecutionContext) {
        task.handle(ctx);
    }
}

/// Handler per phase, with a fallback for phases without their own.
pub struct PhaseHandlers {
    handlers: HashMap<Phase, Arc<dyn PhaseHandler>>,
    fallback: Arc<dyn PhaseHandler>,
}

impl PhaseHandlers {
    pub fn new(fallback: Arc<dyn PhaseHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    /// Default handler everywhere, destroy handler for recover.
    pub fn standard() -> Self {
        let mut handlers = Self::new(Arc::new(DefaultPhaseHandler));
        handlers.insert(Phase::Recover, Arc::new(DestroyPhaseHandler));
        handlers
    }

    pub fn insert(&mut self, phase: Phase, handler: Arc<dyn PhaseHandler>) {
        self.handlers.insert(phase, handler);
    }

    pub fn for_phase(&self, phase: Phase) -> &dyn PhaseHandler {
        self.handlers
            .get(&phase)
            .unwrap_or(&self.fallback)
            .as_ref()
    }
}

impl Default for PhaseHandlers {
    fn default() -> Self {
        Self::standard()
    }
}
