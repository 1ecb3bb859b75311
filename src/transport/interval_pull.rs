//! Fires pull requests per pull-enabled sending PMode on its own cadence.

use crate::domain::{MessageOrigin, ReceivedMessage};
use crate::pmode::PModeStore;
use crate::pull::{PModeRequest, PullSchedule};
use crate::transport::datastore::RECORD_CONTENT_TYPE;
use crate::transport::runtime::ReceiverControl;
use crate::transport::{MessageHandler, Receiver, ReceiverKind, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntervalPullOptions {
    /// Sending PModes to pull for; empty means every PMode with a pull cadence.
    pub pmodes: Vec<String>,
}

pub struct IntervalPullReceiver {
    options: IntervalPullOptions,
    pmodes: Arc<PModeStore>,
    control: ReceiverControl,
}

impl IntervalPullReceiver {
    pub fn new(options: IntervalPullOptions, pmodes: Arc<PModeStore>) -> Self {
        Self {
            options,
            pmodes,
            control: ReceiverControl::new(),
        }
    }

    /// Requests for the configured PModes, read from the current snapshot.
    pub fn requests(&self) -> Vec<PModeRequest> {
        let snapshot = self.pmodes.snapshot();
        let mut requests: Vec<PModeRequest> = if self.options.pmodes.is_empty() {
            snapshot
                .sending_pmodes()
                .filter_map(|pmode| PModeRequest::for_pmode(pmode.clone()))
                .collect()
        } else {
            self.options
                .pmodes
                .iter()
                .filter_map(|id| {
                    let request = snapshot
                        .sending_pmode(id)
                        .and_then(PModeRequest::for_pmode);
                    if request.is_none() {
                        tracing::warn!(pmode = %id, "pmode has no pull configuration; not polling");
                    }
                    request
                })
                .collect()
        };
        requests.sort_by(|left, right| left.pmode_id().cmp(right.pmode_id()));
        requests
    }
}

#[async_trait]
impl Receiver for IntervalPullReceiver {
    fn kind(&self) -> ReceiverKind {
        ReceiverKind::IntervalPull
    }

    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let token = self.control.begin(&shutdown);
        let mut schedule = PullSchedule::new(self.requests(), Instant::now());
        crate::as4_event!(
            info,
            "receiver_started",
            agent = handler.name(),
            pmodes = schedule.len()
        );
        if schedule.is_empty() {
            token.cancelled().await;
            return Ok(());
        }

        loop {
            let Some(next_due) = schedule.next_due() else {
                break;
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(next_due) => {}
            }

            while let Some(index) = schedule.pop_due(Instant::now()) {
                let Some(pmode_id) = schedule
                    .request(index)
                    .map(|request| request.pmode_id().to_string())
                else {
                    continue;
                };
                let message = ReceivedMessage::new(pmode_id.clone().into_bytes(), RECORD_CONTENT_TYPE)
                    .with_origin(MessageOrigin::PullSchedule {
                        pmode_id: pmode_id.clone(),
                    });
                let reply = handler.handle(message).await;
                let exchanged = reply.is_success() && reply.summary.is_exchange();
                let wait = schedule.complete(index, exchanged, Instant::now());
                crate::as4_event!(
                    debug,
                    "pull_completed",
                    agent = handler.name(),
                    pmode = pmode_id,
                    exchanged = exchanged,
                    next_in_ms = wait.map(|wait| wait.as_millis()).unwrap_or_default()
                );
                if token.is_cancelled() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn stop_receiving(&self) {
        self.control.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmode::{PModeSnapshot, PullConfiguration, SendingPMode};
    use std::time::Duration;

    fn pull_pmode(id: &str) -> SendingPMode {
        let mut pmode = SendingPMode::new(id);
        pmode.pull_configuration = Some(PullConfiguration {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            factor: 1.75,
        });
        pmode
    }

    #[test]
    fn only_pmodes_with_a_pull_cadence_are_scheduled() {
        let store = Arc::new(PModeStore::new(PModeSnapshot::new(
            vec![pull_pmode("b"), pull_pmode("a"), SendingPMode::new("push")],
            Vec::new(),
        )));
        let receiver = IntervalPullReceiver::new(IntervalPullOptions::default(), store.clone());
        let ids: Vec<String> = receiver
            .requests()
            .iter()
            .map(|request| request.pmode_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let receiver = IntervalPullReceiver::new(
            IntervalPullOptions {
                pmodes: vec!["push".into(), "b".into()],
            },
            store,
        );
        assert_eq!(receiver.requests().len(), 1);
    }
}
