use super::{Step, TumblingWindow};
use crate::client::QueryClient;
use crate::errors::SequenceError;
use crate::matcher::{MissingPosition, SequenceMatcher};
use crate::request::{SearchRequest, SortOrder};
use crate::sequence::Sequence;
use anyhow::anyhow;
use std::time::Duration;
use tracing::debug;
use tumbler_types::Timestamp;

/// What the edge probes of one sequence found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EdgeEvents {
    /// Latest event found before the sequence.
    pub last_leading: Option<Timestamp>,
    /// Earliest event found after the sequence.
    pub first_trailing: Option<Timestamp>,
}

impl EdgeEvents {
    fn leading(&mut self, timestamp: Timestamp) {
        self.last_leading = Some(self.last_leading.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn trailing(&mut self, timestamp: Timestamp) {
        self.first_trailing = Some(self.first_trailing.map_or(timestamp, |t| t.min(timestamp)));
    }
}

/// Decides whether a sequence whose middle stages were confirmed absent
/// completes, given the events found around it.
pub(crate) fn completes(matcher: &SequenceMatcher, sequence: &Sequence, edges: EdgeEvents) -> bool {
    let last_stage = matcher.stages() - 1;
    let first_missing = matcher.is_missing_event(0);
    let last_missing = matcher.is_missing_event(last_stage);

    match (edges.last_leading, edges.first_trailing) {
        (None, None) => true,
        (None, _) if first_missing => true,
        (_, None) if last_missing => true,
        (Some(leading), Some(trailing)) if first_missing && last_missing => {
            matcher.exceeds_max_span(leading, trailing)
        }
        (Some(leading), _) if first_missing && !last_missing => {
            matcher.exceeds_max_span(leading, sequence.timestamp())
        }
        (_, Some(trailing)) if !first_missing && last_missing => {
            matcher.exceeds_max_span(sequence.start_timestamp(), trailing)
        }
        _ => false,
    }
}

impl<C: QueryClient> TumblingWindow<C> {
    /// Resolves every sequence waiting on a missing-event check, then carries
    /// on with `then`.
    pub(super) async fn check_missing_events(&mut self, then: Step) -> Result<Step, SequenceError> {
        let mut pending = self.matcher.to_check_for_missing();
        if !pending.is_empty() {
            debug!(message = "checking missing events", sequences = pending.len());
        }
        while !pending.is_empty() {
            let rest = pending.split_off(pending.len().min(self.batch_size));
            let batch = std::mem::replace(&mut pending, rest);

            if self.deadline_passed() {
                return Ok(self.time_out(self.matcher.first_positive_stage()));
            }
            if !self.resolve_missing(batch).await? {
                return Ok(Step::Payload);
            }
        }

        if self.limit_reached() {
            debug!(message = "result limit reached", completed = self.matcher.completed().len());
            return Ok(Step::Payload);
        }
        Ok(then)
    }

    /// Probes one batch with a single multi-query. Returns false if the store
    /// timed out.
    async fn resolve_missing(&mut self, batch: Vec<Sequence>) -> Result<bool, SequenceError> {
        let timeout = Some(self.remaining());
        let mut requests = vec![];
        let mut probes: Vec<Vec<(usize, MissingPosition)>> = Vec::with_capacity(batch.len());

        for sequence in &batch {
            let mut stages = vec![];
            for stage in 0..sequence.stages() {
                if let Some(position) = self.matcher.missing_position(stage) {
                    requests.push(self.probe(sequence, stage, position, timeout));
                    stages.push((stage, position));
                }
            }
            probes.push(stages);
        }

        let sent = requests.len();
        let responses = self
            .client
            .multi_query(requests)
            .await
            .map_err(SequenceError::MultiQuery)?;
        if responses.len() != sent {
            return Err(SequenceError::MultiQuery(anyhow!(
                "sent {} probes but received {} responses",
                sent,
                responses.len()
            )));
        }
        if responses.iter().any(|r| r.timed_out) {
            self.time_out(self.matcher.first_positive_stage());
            return Ok(false);
        }

        let mut responses = responses.into_iter();
        let (mut completed, mut discarded) = (0, 0);
        for (sequence, stages) in batch.into_iter().zip(probes) {
            let mut edges = EdgeEvents::default();
            let mut present = false;

            for (stage, position) in stages {
                let Some(response) = responses.next() else {
                    break;
                };
                if position == MissingPosition::Middle {
                    present |= !response.hits.is_empty();
                    continue;
                }
                let Some(timestamp) = response
                    .hits
                    .first()
                    .and_then(|hit| self.criteria[stage].timestamp(hit))
                else {
                    continue;
                };
                match position {
                    MissingPosition::Leading => edges.leading(timestamp),
                    _ => edges.trailing(timestamp),
                }
            }

            if !present && completes(&self.matcher, &sequence, edges) {
                completed += 1;
                self.matcher.add_to_completed(sequence);
            } else {
                discarded += 1;
                self.matcher.discard(sequence);
            }
        }

        debug!(message = "missing event batch resolved", probes = sent, completed, discarded);
        Ok(true)
    }

    fn probe(
        &self,
        sequence: &Sequence,
        stage: usize,
        position: MissingPosition,
        timeout: Option<Duration>,
    ) -> SearchRequest {
        let (lower, upper, order) = match position {
            MissingPosition::Leading => (None, Some(sequence.start_ordinal().clone()), SortOrder::Desc),
            MissingPosition::Trailing => (Some(sequence.ordinal().clone()), None, SortOrder::Asc),
            MissingPosition::Middle => {
                let previous = sequence
                    .previous_match(stage)
                    .expect("a middle stage follows a match");
                let next = sequence
                    .next_match(stage)
                    .expect("a middle stage precedes a match");
                (
                    Some(previous.ordinal.clone()),
                    Some(next.ordinal.clone()),
                    SortOrder::Asc,
                )
            }
        };

        let key = self.has_keys.then(|| sequence.key().clone());
        self.criteria[stage]
            .query_request()
            .probe(lower, upper, order, key, timeout)
    }
}
