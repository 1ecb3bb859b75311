//! Agents bind a receiver to a transformer and a pipeline; the kernel runs
//! every configured agent side by side.

pub mod builder;
pub mod defaults;
pub mod exception;
pub mod kernel;

use crate::app_context::AppContext;
use crate::domain::ReceivedMessage;
use crate::pipeline::runner::{Pipeline, PipelineOutcome};
use crate::transformer::Transformer;
use crate::transport::{ExchangeSummary, MessageHandler, ProcessingReply, Receiver};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use tracing::Instrument;

pub use builder::{build_agents, AgentBuildError};
pub use exception::ExceptionHandler;
pub use kernel::{Kernel, KernelHandle};

/// The logical roles an agent can play.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Submit,
    Send,
    Receive,
    Deliver,
    Notify,
    PullReceive,
    PullSend,
    ReceptionAwareness,
}

impl AgentKind {
    pub const ALL: [AgentKind; 8] = [
        AgentKind::Submit,
        AgentKind::Send,
        AgentKind::Receive,
        AgentKind::Deliver,
        AgentKind::Notify,
        AgentKind::PullReceive,
        AgentKind::PullSend,
        AgentKind::ReceptionAwareness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Submit => "submit",
            AgentKind::Send => "send",
            AgentKind::Receive => "receive",
            AgentKind::Deliver => "deliver",
            AgentKind::Notify => "notify",
            AgentKind::PullReceive => "pull_receive",
            AgentKind::PullSend => "pull_send",
            AgentKind::ReceptionAwareness => "reception_awareness",
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| {
                let known: Vec<&str> = AgentKind::ALL.iter().map(AgentKind::as_str).collect();
                format!(
                    "unknown agent kind `{value}` (expected one of {})",
                    known.join(", ")
                )
            })
    }
}

/// Transformer, pipeline and exception handler of one agent. Handed to the
/// receiver as its message handler.
pub struct AgentProcessor {
    name: String,
    kind: AgentKind,
    transformer: Arc<dyn Transformer>,
    pipeline: Pipeline,
    exception_handler: ExceptionHandler,
    app: Arc<AppContext>,
}

impl AgentProcessor {
    pub fn new(
        name: impl Into<String>,
        kind: AgentKind,
        transformer: Arc<dyn Transformer>,
        pipeline: Pipeline,
        app: Arc<AppContext>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            transformer,
            pipeline,
            exception_handler: ExceptionHandler::for_kind(kind),
            app,
        }
    }

    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    async fn process(&self, message: ReceivedMessage) -> ProcessingReply {
        let app = self.app.as_ref();
        let fallback = message.clone();
        let mut context = match self.transformer.transform(message, app).await {
            Ok(context) => context,
            Err(err) => {
                let error = err.into_processing_error();
                crate::as4_event!(
                    warn,
                    "transform_failed",
                    agent = self.name,
                    transformer = self.transformer.name(),
                    origin = fallback.origin,
                    error = error.description
                );
                let mut context = crate::pipeline::MessagingContext::from_received(fallback);
                context.set_error(error.clone());
                self.exception_handler.handle(&context, &error, app).await;
                return ProcessingReply {
                    outcome: PipelineOutcome::Failed {
                        step: format!("transform:{}", self.transformer.name()),
                        error,
                    },
                    response: None,
                    summary: ExchangeSummary::default(),
                };
            }
        };

        let span = tracing::info_span!(
            "pipeline",
            agent = %self.name,
            message_id = context.message_id().unwrap_or("-")
        );
        let outcome = self.pipeline.run(&mut context, app).instrument(span).await;

        if let Some(error) = outcome.error() {
            self.exception_handler.handle(&context, error, app).await;
        } else {
            crate::as4_event!(
                debug,
                "message_processed",
                agent = self.name,
                message_id = context.message_id().unwrap_or("-"),
                outcome = outcome
            );
        }

        let summary = context
            .as4_message
            .as_ref()
            .map(ExchangeSummary::of)
            .unwrap_or_default();
        ProcessingReply {
            outcome,
            response: context.reply.take(),
            summary,
        }
    }
}

#[async_trait]
impl MessageHandler for AgentProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: ReceivedMessage) -> ProcessingReply {
        self.process(message).await
    }
}

/// A configured agent: the receiver that feeds it and the processor it feeds.
pub struct Agent {
    name: String,
    receiver: Arc<dyn Receiver>,
    processor: Arc<AgentProcessor>,
}

impl Agent {
    pub fn new(receiver: Arc<dyn Receiver>, processor: AgentProcessor) -> Self {
        Self {
            name: processor.name.clone(),
            receiver,
            processor: Arc::new(processor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AgentKind {
        self.processor.kind
    }

    pub fn receiver(&self) -> &Arc<dyn Receiver> {
        &self.receiver
    }

    pub fn processor(&self) -> &Arc<AgentProcessor> {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_their_names() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>(), Ok(kind));
        }
        let err = "courier".parse::<AgentKind>().unwrap_err();
        assert!(err.contains("pull_receive"));
    }
}
