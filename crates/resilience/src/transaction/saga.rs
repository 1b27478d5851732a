//! Saga coordinator
//!
//! A saga is an ordered list of steps, each run in its own unit of work
//! through the [`TransactionManager`]. When a step fails terminally, every
//! step that already completed is compensated in strict reverse order. A
//! failing compensation is reported and the sweep continues.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::manager::{TransactionManager, TxOptions};
use super::unit::Transaction;
use crate::error::{ControlError, ControlResult};
use crate::observability::SagaListener;

/// One forward action plus its compensating action
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    /// Forward action; its output is handed to later steps and to
    /// [`compensate`](Self::compensate)
    async fn action(&self, tx: Arc<dyn Transaction>, context: &SagaContext) -> ControlResult<Value>;

    /// Undo a completed action
    async fn compensate(&self, output: &Value) -> ControlResult<()>;
}

/// Outputs of the steps completed so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaContext {
    saga_id: Option<String>,
    outputs: Vec<(String, Value)>,
}

impl SagaContext {
    pub fn saga_id(&self) -> Option<&str> {
        self.saga_id.as_deref()
    }

    /// Output of the completed step named `step`
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.iter().find(|(name, _)| name == step).map(|(_, output)| output)
    }

    /// Output of the most recently completed step
    pub fn last_output(&self) -> Option<&Value> {
        self.outputs.last().map(|(_, output)| output)
    }
}

/// A compensation that failed during rollback
#[derive(Debug, Clone, Serialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

/// Result of a saga run
#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub success: bool,
    /// Names of steps whose action completed, in execution order
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<ControlError>,
    pub compensation_failures: Vec<CompensationFailure>,
    /// Outputs of the completed steps
    pub context: SagaContext,
}

/// Runs sagas through a shared transaction manager
pub struct SagaCoordinator {
    manager: Arc<TransactionManager>,
    listener: Option<Arc<dyn SagaListener>>,
    step_options: TxOptions,
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaCoordinator")
            .field("step_options", &self.step_options)
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl SagaCoordinator {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self { manager, listener: None, step_options: TxOptions::default() }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn SagaListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Retry and timeout applied to every step (any idempotency key is
    /// ignored; keys derive from the saga id)
    #[must_use]
    pub fn with_step_options(mut self, options: TxOptions) -> Self {
        self.step_options = TxOptions { idempotency_key: None, ..options };
        self
    }

    /// Run `steps` in order, compensating completed steps on failure
    pub async fn execute_saga(&self, steps: Vec<Box<dyn SagaStep>>) -> SagaOutcome {
        self.run(None, steps).await
    }

    /// Like [`execute_saga`](Self::execute_saga), with per-step idempotency
    /// keys `{saga_id}:{step}` so a re-run skips steps that already completed
    ///
    /// Compensated steps lose their key and run again on a re-run. A step
    /// whose compensation failed keeps it.
    pub async fn execute_saga_with_id(
        &self,
        saga_id: &str,
        steps: Vec<Box<dyn SagaStep>>,
    ) -> SagaOutcome {
        self.run(Some(saga_id.to_string()), steps).await
    }

    #[instrument(skip(self, steps), fields(step_count = steps.len()))]
    async fn run(&self, saga_id: Option<String>, steps: Vec<Box<dyn SagaStep>>) -> SagaOutcome {
        let mut context = SagaContext { saga_id, outputs: Vec::new() };
        let mut completed = 0;
        let mut failure = None;

        for step in &steps {
            let mut options = self.step_options.clone();
            if let Some(id) = &context.saga_id {
                options.idempotency_key = Some(step_key(id, step.name()));
            }

            let step_context = &context;
            let result = self
                .manager
                .execute(options, |tx| async move { step.action(tx, step_context).await })
                .await;

            match result {
                Ok(output) => {
                    context.outputs.push((step.name().to_string(), output));
                    completed += 1;
                }
                Err(step_error) => {
                    warn!(step = step.name(), error = %step_error, "Saga step failed");
                    failure = Some((step.name().to_string(), step_error));
                    break;
                }
            }
        }

        let completed_steps: Vec<String> =
            context.outputs.iter().map(|(name, _)| name.clone()).collect();

        let Some((failed_step, step_error)) = failure else {
            info!(steps = completed, "Saga completed");
            return SagaOutcome {
                success: true,
                completed_steps,
                failed_step: None,
                error: None,
                compensation_failures: Vec::new(),
                context,
            };
        };

        let compensation_failures = self.compensate(&steps[..completed], &context).await;
        SagaOutcome {
            success: false,
            completed_steps,
            failed_step: Some(failed_step),
            error: Some(step_error),
            compensation_failures,
            context,
        }
    }

    async fn compensate(
        &self,
        completed: &[Box<dyn SagaStep>],
        context: &SagaContext,
    ) -> Vec<CompensationFailure> {
        let saga = context.saga_id().unwrap_or("saga");
        let mut failures = Vec::new();

        for (step, (_, output)) in completed.iter().zip(&context.outputs).rev() {
            match step.compensate(output).await {
                Ok(()) => {
                    info!(saga, step = step.name(), "Compensated saga step");
                    if let Some(id) = context.saga_id() {
                        self.forget_step(id, step.name()).await;
                    }
                }
                Err(compensation_error) => {
                    error!(
                        saga,
                        step = step.name(),
                        error = %compensation_error,
                        "Compensation failed, continuing rollback"
                    );
                    if let Some(listener) = &self.listener {
                        listener.on_compensation_failure(saga, step.name(), &compensation_error);
                    }
                    failures.push(CompensationFailure {
                        step: step.name().to_string(),
                        error: compensation_error.to_string(),
                    });
                }
            }
        }

        failures
    }

    /// Drop the stored output of an undone step so a re-run executes it again
    async fn forget_step(&self, saga_id: &str, step: &str) {
        let key = step_key(saga_id, step);
        if let Err(remove_error) = self.manager.idempotency().remove(&key).await {
            warn!(key, error = %remove_error, "Could not forget compensated step");
        }
    }
}

fn step_key(saga_id: &str, step: &str) -> String {
    format!("{saga_id}:{step}")
}
