use crate::app_context::AppContext;
use crate::pipeline::context::MessagingContext;
use crate::pipeline::failure::ProcessingError;
use crate::pipeline::step::{Step, StepResult};
use crate::telemetry::runtime_counters;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::Instrument;

/// Ordered normal-path steps plus the steps that turn a failure into an
/// error artifact.
#[derive(Clone, Default)]
pub struct StepConfiguration {
    pub normal: Vec<Arc<dyn Step>>,
    pub error: Vec<Arc<dyn Step>>,
}

impl StepConfiguration {
    pub fn new(normal: Vec<Arc<dyn Step>>, error: Vec<Arc<dyn Step>>) -> Self {
        Self { normal, error }
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.normal.iter().map(|step| step.name()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    Stopped { step: String },
    Failed { step: String, error: ProcessingError },
    Faulted { step: String, error: ProcessingError },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Completed | PipelineOutcome::Stopped { .. }
        )
    }

    pub fn error(&self) -> Option<&ProcessingError> {
        match self {
            PipelineOutcome::Failed { error, .. } | PipelineOutcome::Faulted { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }
}

impl Display for PipelineOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineOutcome::Completed => f.write_str("completed"),
            PipelineOutcome::Stopped { step } => write!(f, "stopped at `{step}`"),
            PipelineOutcome::Failed { step, error } => write!(f, "failed at `{step}`: {error}"),
            PipelineOutcome::Faulted { step, error } => write!(f, "faulted at `{step}`: {error}"),
        }
    }
}

/// Executes steps strictly in order, one context at a time.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: StepConfiguration,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: StepConfiguration) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &StepConfiguration {
        &self.steps
    }

    pub async fn run(&self, context: &mut MessagingContext, app: &AppContext) -> PipelineOutcome {
        for (index, step) in self.steps.normal.iter().enumerate() {
            let span = tracing::debug_span!("step", step = step.name(), index = index);
            let result = step.execute(context, app).instrument(span).await;

            match result {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Stop) => {
                    tracing::debug!(
                        pipeline = %self.name,
                        step = step.name(),
                        "pipeline stopped by step"
                    );
                    return PipelineOutcome::Stopped {
                        step: step.name().to_string(),
                    };
                }
                Ok(StepResult::Failed(error)) => {
                    runtime_counters().inc_pipeline_failures();
                    tracing::warn!(
                        pipeline = %self.name,
                        step = step.name(),
                        category = %error.category,
                        code = %error.error_code(),
                        error = %error.description,
                        "step failed"
                    );
                    context.set_error(error.clone());
                    self.run_error_steps(context, app).await;
                    return PipelineOutcome::Failed {
                        step: step.name().to_string(),
                        error,
                    };
                }
                Err(fault) => {
                    runtime_counters().inc_pipeline_faults();
                    tracing::error!(
                        pipeline = %self.name,
                        step = step.name(),
                        error = %fault,
                        "step faulted"
                    );
                    let error = ProcessingError::unexpected(fault.to_string());
                    context.set_error(error.clone());
                    self.run_error_steps(context, app).await;
                    return PipelineOutcome::Faulted {
                        step: step.name().to_string(),
                        error,
                    };
                }
            }
        }

        PipelineOutcome::Completed
    }

    async fn run_error_steps(&self, context: &mut MessagingContext, app: &AppContext) {
        for step in &self.steps.error {
            let span = tracing::debug_span!("error_step", step = step.name());
            match step.execute(context, app).instrument(span).await {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Stop) => break,
                Ok(StepResult::Failed(error)) => {
                    tracing::warn!(
                        pipeline = %self.name,
                        step = step.name(),
                        error = %error,
                        "error step failed; abandoning error handling"
                    );
                    break;
                }
                Err(fault) => {
                    tracing::error!(
                        pipeline = %self.name,
                        step = step.name(),
                        error = %fault,
                        "error step faulted; abandoning error handling"
                    );
                    break;
                }
            }
        }
    }
}
