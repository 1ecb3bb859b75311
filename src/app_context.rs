//! Shared collaborators constructed once at startup and handed to every agent.

use crate::clock::{Clock, SystemClock};
use crate::codec::CodecRegistry;
use crate::pmode::PModeStore;
use crate::security::{KeyringSecurityProvider, SecurityProvider};
use crate::store::{InMemoryRepository, MessageRepository};
use crate::transport::queue::QueueHub;
use crate::transport::sender::{default_sender, MessageSender};
use crate::transport::sink::SinkRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct AppContext {
    repository: Arc<dyn MessageRepository>,
    pmodes: Arc<PModeStore>,
    codecs: CodecRegistry,
    security: Arc<dyn SecurityProvider>,
    sender: Arc<dyn MessageSender>,
    sinks: SinkRegistry,
    clock: Arc<dyn Clock>,
    queues: QueueHub,
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::default()
    }

    pub fn repository(&self) -> &dyn MessageRepository {
        self.repository.as_ref()
    }

    pub fn repository_handle(&self) -> Arc<dyn MessageRepository> {
        self.repository.clone()
    }

    pub fn pmodes(&self) -> &Arc<PModeStore> {
        &self.pmodes
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn security(&self) -> &dyn SecurityProvider {
        self.security.as_ref()
    }

    pub fn sender(&self) -> &dyn MessageSender {
        self.sender.as_ref()
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    pub fn queues(&self) -> &QueueHub {
        &self.queues
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[derive(Default)]
pub struct AppContextBuilder {
    repository: Option<Arc<dyn MessageRepository>>,
    pmodes: Option<Arc<PModeStore>>,
    codecs: Option<CodecRegistry>,
    security: Option<Arc<dyn SecurityProvider>>,
    sender: Option<Arc<dyn MessageSender>>,
    sinks: Option<SinkRegistry>,
    clock: Option<Arc<dyn Clock>>,
    queues: Option<QueueHub>,
}

impl AppContextBuilder {
    pub fn repository(mut self, repository: Arc<dyn MessageRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn pmodes(mut self, pmodes: Arc<PModeStore>) -> Self {
        self.pmodes = Some(pmodes);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn sinks(mut self, sinks: SinkRegistry) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn queues(mut self, queues: QueueHub) -> Self {
        self.queues = Some(queues);
        self
    }

    /// Fills anything not provided with the process-local defaults.
    pub fn build(self) -> Arc<AppContext> {
        Arc::new(AppContext {
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemoryRepository::new())),
            pmodes: self.pmodes.unwrap_or_default(),
            codecs: self.codecs.unwrap_or_default(),
            security: self
                .security
                .unwrap_or_else(|| Arc::new(KeyringSecurityProvider::new())),
            sender: self.sender.unwrap_or_else(default_sender),
            sinks: self.sinks.unwrap_or_else(SinkRegistry::with_defaults),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            queues: self.queues.unwrap_or_default(),
        })
    }
}
