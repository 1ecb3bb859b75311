use crate::agent::{Agent, AgentProcessor};
use crate::app_context::AppContext;
use crate::config::agents::{AgentSettings, AgentsConfig};
use crate::pipeline::registry::{ComponentRegistry, RegistryError};
use crate::pipeline::runner::{Pipeline, StepConfiguration};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("agent `{agent}`: {source}")]
pub struct AgentBuildError {
    pub agent: String,
    #[source]
    pub source: RegistryError,
}

pub fn build_agent(
    settings: &AgentSettings,
    registry: &ComponentRegistry,
    app: &Arc<AppContext>,
) -> Result<Agent, RegistryError> {
    let receiver = registry.receiver(
        &settings.receiver.receiver_type,
        &settings.receiver.options,
        app,
    )?;
    let transformer = registry.transformer(&settings.transformer)?;
    let steps = StepConfiguration::new(
        registry.steps(&settings.steps.normal)?,
        registry.steps(&settings.steps.error)?,
    );
    let pipeline = Pipeline::new(settings.name.clone(), steps);
    let processor = AgentProcessor::new(
        settings.name.clone(),
        settings.kind,
        transformer,
        pipeline,
        Arc::clone(app),
    );
    Ok(Agent::new(receiver, processor))
}

/// Builds every configured agent, or none if one of them cannot be built.
pub fn build_agents(
    config: &AgentsConfig,
    registry: &ComponentRegistry,
    app: &Arc<AppContext>,
) -> Result<Vec<Agent>, AgentBuildError> {
    config
        .agents
        .iter()
        .map(|settings| {
            let agent = build_agent(settings, registry, app).map_err(|source| AgentBuildError {
                agent: settings.name.clone(),
                source,
            })?;
            tracing::debug!(
                agent = %settings.name,
                kind = %settings.kind,
                receiver = %agent.receiver().kind(),
                transformer = %settings.transformer,
                steps = ?agent.processor().pipeline().steps().step_names(),
                "agent configured"
            );
            Ok(agent)
        })
        .collect()
}
