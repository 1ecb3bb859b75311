use crate::agent::Agent;
use crate::transport::{MessageHandler, Receiver, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("agent `{agent}` stopped with an error: {source}")]
    Agent {
        agent: String,
        #[source]
        source: TransportError,
    },
    #[error("agents did not drain within {0:?}")]
    DrainTimeout(Duration),
}

type AgentExit = (String, Result<(), TransportError>);

/// Owns every configured agent and runs their receive loops side by side.
#[derive(Default)]
pub struct Kernel {
    agents: Vec<Agent>,
}

impl Kernel {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self { agents }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Spawns one receive loop per agent. Cancelling `shutdown` (or calling
    /// [`KernelHandle::stop`]) stops all of them.
    pub fn start(&self, shutdown: CancellationToken) -> KernelHandle {
        let mut tasks = JoinSet::new();
        let mut receivers = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let name = agent.name().to_string();
            let receiver = Arc::clone(agent.receiver());
            let handler: Arc<dyn MessageHandler> = agent.processor().clone();
            let token = shutdown.clone();
            receivers.push(Arc::clone(&receiver));
            crate::as4_event!(
                info,
                "agent_starting",
                agent = name,
                kind = agent.kind(),
                receiver = receiver.kind()
            );
            tasks.spawn(async move {
                let result = receiver.start_receiving(handler, token).await;
                (name, result)
            });
        }
        KernelHandle {
            shutdown,
            tasks,
            receivers,
        }
    }

    /// Releases every receiver. Safe without a prior start and safe to repeat.
    pub fn stop(&self) {
        for agent in &self.agents {
            agent.receiver().stop_receiving();
        }
    }
}

pub struct KernelHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<AgentExit>,
    receivers: Vec<Arc<dyn Receiver>>,
}

impl KernelHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        for receiver in &self.receivers {
            receiver.stop_receiving();
        }
    }

    /// Waits for the next agent loop to end. `None` once no loop is left.
    pub async fn next_exit(&mut self) -> Option<Result<String, KernelError>> {
        loop {
            match self.tasks.join_next().await? {
                Ok((agent, Ok(()))) => return Some(Ok(agent)),
                Ok((agent, Err(source))) => {
                    return Some(Err(KernelError::Agent { agent, source }))
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "agent task cancelled");
                }
            }
        }
    }

    /// Stops every agent and waits up to `drain` for in-flight runs to finish.
    pub async fn join(mut self, drain: Duration) -> Result<(), KernelError> {
        self.stop();
        let tasks = &mut self.tasks;
        let drained = timeout(drain, async {
            let mut first_error = None;
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok((agent, Ok(()))) => {
                        crate::as4_event!(info, "agent_stopped", agent = agent);
                    }
                    Ok((agent, Err(source))) => {
                        crate::as4_event!(error, "agent_failed", agent = agent, error = source);
                        first_error.get_or_insert(KernelError::Agent { agent, source });
                    }
                    Err(join_err) => {
                        tracing::warn!(error = %join_err, "agent task cancelled");
                    }
                }
            }
            first_error
        })
        .await;

        match drained {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => {
                tracing::error!(
                    timeout_secs = drain.as_secs_f64(),
                    "agents did not drain in time; aborting"
                );
                self.tasks.shutdown().await;
                Err(KernelError::DrainTimeout(drain))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentKind, AgentProcessor};
    use crate::app_context::AppContext;
    use crate::pipeline::runner::{Pipeline, StepConfiguration};
    use crate::transformer::SubmitTransformer;
    use crate::transport::queue::QueueReceiver;

    #[tokio::test]
    async fn zero_agents_start_and_stop_quietly() {
        let kernel = Kernel::default();
        kernel.stop();
        let handle = kernel.start(CancellationToken::new());
        assert_eq!(handle.running(), 0);
        handle.join(Duration::from_millis(50)).await.unwrap();
        kernel.stop();
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let app = AppContext::builder().build();
        let processor = AgentProcessor::new(
            "submit",
            AgentKind::Submit,
            Arc::new(SubmitTransformer),
            Pipeline::new("submit", StepConfiguration::default()),
            app.clone(),
        );
        let receiver = Arc::new(QueueReceiver::new("submit", app.queues().clone()));
        let kernel = Kernel::new(vec![Agent::new(receiver, processor)]);
        kernel.stop();
        kernel.stop();

        let handle = kernel.start(CancellationToken::new());
        handle.join(Duration::from_secs(1)).await.unwrap();
    }
}
