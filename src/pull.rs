//! Pull scheduling state: one interval per pull-enabled sending PMode, growing
//! while the partner has nothing for us and snapping back on a real exchange.

use crate::pmode::{PullConfiguration, SendingPMode};
use crate::reliability::backoff_interval;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct IntervalRequest {
    min_interval: Duration,
    max_interval: Duration,
    factor: f64,
    current_interval: Duration,
    runs: u32,
}

impl IntervalRequest {
    pub fn new(min_interval: Duration, max_interval: Duration, factor: f64) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
            factor,
            current_interval: min_interval,
            runs: 0,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// Grows the interval after an unsuccessful poll. Saturated intervals stay put.
    pub fn calculate_new_interval(&mut self) {
        if self.current_interval >= self.max_interval {
            return;
        }
        self.runs = self.runs.saturating_add(1);
        let next = backoff_interval(self.min_interval, self.max_interval, self.factor, self.runs);
        self.current_interval = next.max(self.current_interval);
    }

    pub fn reset_interval(&mut self) {
        self.runs = 0;
        self.current_interval = self.min_interval;
    }
}

impl From<&PullConfiguration> for IntervalRequest {
    fn from(config: &PullConfiguration) -> Self {
        Self::new(config.min_interval, config.max_interval, config.factor)
    }
}

#[derive(Clone, Debug)]
pub struct PModeRequest {
    pub pmode: Arc<SendingPMode>,
    pub interval: IntervalRequest,
}

impl PModeRequest {
    /// `None` when the PMode carries no pull cadence.
    pub fn for_pmode(pmode: Arc<SendingPMode>) -> Option<Self> {
        let interval = IntervalRequest::from(pmode.pull_configuration.as_ref()?);
        Some(Self { pmode, interval })
    }

    pub fn pmode_id(&self) -> &str {
        &self.pmode.id
    }
}

/// Due-time ordered set of pull requests owned by a single scheduler loop.
#[derive(Debug, Default)]
pub struct PullSchedule {
    requests: Vec<PModeRequest>,
    due: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl PullSchedule {
    pub fn new(requests: Vec<PModeRequest>, start: Instant) -> Self {
        let due = (0..requests.len())
            .map(|index| Reverse((start, index)))
            .collect();
        Self { requests, due }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.due.peek().map(|Reverse((at, _))| *at)
    }

    /// Removes the earliest request if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<usize> {
        match self.due.peek() {
            Some(Reverse((at, _))) if *at <= now => self.due.pop().map(|Reverse((_, index))| index),
            _ => None,
        }
    }

    pub fn request(&self, index: usize) -> Option<&PModeRequest> {
        self.requests.get(index)
    }

    /// Records the poll outcome and re-queues the request after its new interval.
    pub fn complete(&mut self, index: usize, exchanged: bool, now: Instant) -> Option<Duration> {
        let request = self.requests.get_mut(index)?;
        if exchanged {
            request.interval.reset_interval();
        } else {
            request.interval.calculate_new_interval();
        }
        let wait = request.interval.current_interval();
        self.due.push(Reverse((now + wait, index)));
        Some(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IntervalRequest {
        IntervalRequest::new(Duration::from_secs(1), Duration::from_secs(10), 1.75)
    }

    fn sequence(request: &mut IntervalRequest, steps: usize) -> Vec<u128> {
        let mut observed = vec![request.current_interval().as_millis()];
        for _ in 0..steps {
            request.calculate_new_interval();
            observed.push(request.current_interval().as_millis());
        }
        observed
    }

    #[test]
    fn interval_follows_the_backoff_sequence_and_saturates() {
        let mut request = request();
        assert_eq!(
            sequence(&mut request, 7),
            vec![1000, 1750, 3062, 5359, 9378, 10000, 10000, 10000]
        );
    }

    #[test]
    fn saturated_interval_does_not_count_runs() {
        let mut request = request();
        sequence(&mut request, 5);
        let runs = request.runs();
        request.calculate_new_interval();
        assert_eq!(request.runs(), runs);
    }

    #[test]
    fn reset_reproduces_the_original_sequence() {
        let mut request = request();
        let first = sequence(&mut request, 6);
        request.reset_interval();
        assert_eq!(request.runs(), 0);
        assert_eq!(sequence(&mut request, 6), first);
    }

    #[test]
    fn schedule_orders_requests_by_due_time() {
        let mut fast = SendingPMode::new("fast");
        fast.pull_configuration = Some(PullConfiguration {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            factor: 1.75,
        });
        let mut slow = fast.clone();
        slow.id = "slow".into();
        slow.pull_configuration = Some(PullConfiguration {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(50),
            factor: 1.75,
        });

        let start = Instant::now();
        let requests = [slow, fast]
            .into_iter()
            .filter_map(|pmode| PModeRequest::for_pmode(Arc::new(pmode)))
            .collect();
        let mut schedule = PullSchedule::new(requests, start);

        let first = schedule.pop_due(start).unwrap();
        let second = schedule.pop_due(start).unwrap();
        assert!(schedule.pop_due(start).is_none());

        schedule.complete(first, true, start);
        schedule.complete(second, true, start);
        let next = schedule.pop_due(start + Duration::from_millis(100)).unwrap();
        assert_eq!(schedule.request(next).unwrap().pmode_id(), "fast");
    }
}
