use tracing::debug;

use super::TaskKey;
use crate::errors::EngineError;
use crate::invoker::RequestCommand;
use crate::model::Phase;
use crate::pipeline::ExecutionContext;

/// A remote resource whose state is polled until terminal.
#[derive(Debug, Clone)]
pub struct StatusProbe {
    pub key: TaskKey,
    pub scope: String,
    pub scene_code: String,
    pub name: String,
}

/// Resource phase that ends polling for a task phase.
pub fn acceptance_phase(phase: Phase) -> &'static str {
    match phase {
        Phase::Attack => "Running",
        _ => "Destroyed",
    }
}

/// Poll the resource's status every `poll_interval` until it is terminal.
///
/// Each round waits first, then issues a STATUS request. A failed call or a
/// reported error ends polling with that error. A successful response, or a
/// resource phase equal to the acceptance phase, ends it successfully. Any
/// other answer schedules the next round. With `max_poll_attempts` unset
/// polling never gives up.
pub async fn reconcile(ctx: &ExecutionContext, probe: &StatusProbe) -> Result<(), EngineError> {
    let settings = ctx.settings();
    let accept = acceptance_phase(probe.key.phase);
    let mut attempts: u32 = 0;

    loop {
        ctx.timer().sleep(settings.poll_interval).await;
        attempts += 1;

        let request = RequestCommand::new(&probe.scope, Phase::Status, &probe.scene_code)
            .with_name(probe.name.clone());
        let response = ctx.invokers().invoke(request).await?;
        debug!(
            experiment_task_id = probe.key.experiment_task_id,
            activity_task_id = probe.key.activity_task_id,
            resource = %probe.name,
            attempt = attempts,
            resource_phase = response.resource_phase.as_deref().unwrap_or_default(),
            success = response.success,
            "Polled resource status"
        );

        if response.success {
            return Ok(());
        }
        if let Some(error) = response.error_text() {
            return Err(EngineError::Business(error.to_string()));
        }
        if response.resource_phase.as_deref() == Some(accept) {
            return Ok(());
        }
        if settings.max_poll_attempts.is_some_and(|max| attempts >= max) {
            return Err(EngineError::ReconcileExhausted {
                name: probe.name.clone(),
                attempts,
            });
        }
    }
}
