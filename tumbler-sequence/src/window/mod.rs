use crate::client::{QueryClient, SearchResponse};
use crate::config::SequenceConfig;
use crate::criterion::SequenceCriterion;
use crate::errors::{invalid, SequenceError};
use crate::matcher::{KeyAndOrdinal, SequenceMatcher};
use crate::payload::Payload;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use tumbler_types::{HitReference, KeyCache, Ordinal, SearchHit};

mod missing;

type Hits = Vec<(Ordinal, SearchHit)>;

/// The ordinal range discovered by one base query. Every other stage is boxed
/// into it for the rest of the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub base_stage: usize,
    pub begin: Ordinal,
    pub end: Ordinal,
}

impl Display for WindowInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} [{} -> {}]", self.base_stage, self.begin, self.end)
    }
}

/// Next action of the window. Each step runs at most one query and hands back
/// its successor, so long runs never grow the stack.
#[derive(Debug)]
pub(crate) enum Step {
    Tumble(usize),
    Rebase(usize),
    Advance(usize),
    CompleteBase {
        stage: usize,
        hits: Hits,
        full: bool,
        window: Option<WindowInfo>,
    },
    Secondary {
        window: WindowInfo,
        stage: usize,
    },
    Until {
        window: WindowInfo,
        then: Box<Step>,
    },
    MissingEvents(Box<Step>),
    Payload,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Tumble(_) => "tumble",
            Step::Rebase(_) => "rebase",
            Step::Advance(_) => "advance",
            Step::CompleteBase { .. } => "complete-base",
            Step::Secondary { .. } => "secondary",
            Step::Until { .. } => "until",
            Step::MissingEvents(_) => "missing-events",
            Step::Payload => "payload",
        }
    }

    fn after_missing_events(then: Step) -> Step {
        Step::MissingEvents(Box::new(then))
    }
}

/// Drives the stage queries of one sequence definition against a
/// [`QueryClient`], feeding hits into a [`SequenceMatcher`] until the data is
/// exhausted, the result limit is reached or the time budget runs out.
pub struct TumblingWindow<C: QueryClient> {
    client: C,
    criteria: Vec<SequenceCriterion>,
    until: Option<SequenceCriterion>,
    matcher: SequenceMatcher,
    key_cache: KeyCache,
    has_keys: bool,
    tail: bool,
    limit: Option<usize>,
    batch_size: usize,
    timeout: Duration,
    start: Instant,
    first_run: bool,
    timed_out: bool,
}

impl<C: QueryClient> TumblingWindow<C> {
    pub fn new(
        client: C,
        criteria: Vec<SequenceCriterion>,
        until: Option<SequenceCriterion>,
        config: &SequenceConfig,
    ) -> Result<Self, SequenceError> {
        config.validate()?;

        if criteria.is_empty() {
            return Err(invalid("a sequence needs at least one stage"));
        }
        for (i, criterion) in criteria.iter().enumerate() {
            if criterion.stage() != i {
                return Err(invalid(format!(
                    "criterion at position {} declares stage {}",
                    i,
                    criterion.stage()
                )));
            }
        }

        let key_size = criteria[0].key_size();
        if let Some(c) = criteria
            .iter()
            .chain(until.iter())
            .find(|c| c.key_size() != key_size)
        {
            return Err(invalid(format!(
                "stage {} has {} keys, expected {}",
                c.stage(),
                c.key_size(),
                key_size
            )));
        }

        let missing: Vec<bool> = criteria.iter().map(SequenceCriterion::missing).collect();
        let first_positive = missing
            .iter()
            .position(|m| !m)
            .ok_or_else(|| invalid("a sequence needs at least one non-missing stage"))?;
        let tail = criteria[first_positive].descending();

        if let Some(c) = criteria
            .iter()
            .find(|c| c.descending() && c.stage() != first_positive)
        {
            return Err(invalid(format!(
                "only the first positive stage may run descending, not stage {}",
                c.stage()
            )));
        }

        let edge_missing = missing.first() == Some(&true) || missing.last() == Some(&true);
        if edge_missing && config.max_span().is_none() {
            return Err(invalid(
                "missing events before the first or after the last stage require a max span",
            ));
        }

        // TAIL runs enforce the limit between windows so the newest sequences win
        let matcher_limit = if tail { None } else { config.result_limit };
        let mut matcher = SequenceMatcher::new(
            missing,
            config.max_span(),
            matcher_limit,
            config.max_candidates_per_key,
        )?;
        if tail {
            matcher = matcher.with_descending_pages();
        }

        Ok(TumblingWindow {
            client,
            criteria,
            until,
            matcher,
            key_cache: KeyCache::new(config.key_cache_capacity, config.case_insensitive_keys),
            has_keys: key_size > 0,
            tail,
            limit: config.result_limit,
            batch_size: config.missing_check_batch_size,
            timeout: config.timeout(),
            start: Instant::now(),
            first_run: true,
            timed_out: false,
        })
    }

    pub fn matcher(&self) -> &SequenceMatcher {
        &self.matcher
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn tail(&self) -> bool {
        self.tail
    }

    /// Runs the window to completion. The client is closed whatever the
    /// outcome.
    pub async fn execute(&mut self) -> Result<Payload, SequenceError> {
        self.start = Instant::now();
        info!(
            message = "starting sequence window",
            stages = self.criteria.len(),
            tail = self.tail,
            until = self.until.is_some(),
            timeout_ms = self.timeout.as_millis() as u64
        );

        let result = self.run().await;

        if let Err(e) = self.client.close().await {
            warn!(message = "failed to close query client", error = ?e);
        }

        match &result {
            Ok(payload) => info!(
                message = "sequence window finished",
                sequences = payload.len(),
                timed_out = payload.timed_out,
                took_ms = payload.took_ms,
                stats = %self.matcher.stats()
            ),
            Err(e) => warn!(message = "sequence window failed", error = %e),
        }
        result
    }

    async fn run(&mut self) -> Result<Payload, SequenceError> {
        let mut step = Step::Tumble(self.matcher.first_positive_stage());
        loop {
            step = match step {
                Step::Payload => return self.payload().await,
                step => self.step(step).await?,
            };
        }
    }

    pub(crate) async fn step(&mut self, step: Step) -> Result<Step, SequenceError> {
        trace!(message = "window step", step = step.name());
        match step {
            Step::Tumble(stage) => Ok(self.tumble(stage)),
            Step::Rebase(stage) => Ok(self.rebase(stage)),
            Step::Advance(stage) => self.advance(stage).await,
            Step::CompleteBase {
                stage,
                hits,
                full,
                window,
            } => Ok(self.complete_base(stage, hits, full, window)),
            Step::Secondary { window, stage } => self.secondary(window, stage).await,
            Step::Until { window, then } => self.until_check(window, *then).await,
            Step::MissingEvents(then) => self.check_missing_events(*then).await,
            Step::Payload => Ok(Step::Payload),
        }
    }

    fn tumble(&mut self, stage: usize) -> Step {
        let first = self.matcher.first_positive_stage();

        if stage > first && !self.matcher.has_candidates() {
            return if self.tail {
                debug!(message = "no candidates left, restarting tail", stage);
                Step::Tumble(first)
            } else {
                debug!(message = "no candidates left", stage);
                Step::after_missing_events(Step::Payload)
            };
        }

        if self.tail && stage == first {
            self.matcher.seal_page();
            self.matcher.trim(None);
            if let Some(until) = self.until.as_mut() {
                let request = until.query_request_mut();
                request.set_from(None);
                request.reset_after();
            }
        } else if let Some(after) = self.criteria[stage].query_request().after().cloned() {
            self.matcher.trim(Some(&after));
        }

        debug!(message = "tumbling window", stage);
        Step::after_missing_events(Step::Advance(stage))
    }

    fn rebase(&mut self, stage: usize) -> Step {
        debug!(message = "rebasing window", stage);
        Step::Advance(stage)
    }

    async fn advance(&mut self, stage: usize) -> Result<Step, SequenceError> {
        if self.deadline_passed() {
            return Ok(self.time_out(stage));
        }

        self.criteria[stage].query_request_mut().set_to(None);
        let response = if self.apply_keys(stage) {
            let request = self.criteria[stage]
                .query_request()
                .to_search_request(Some(self.remaining()));
            trace!(message = "base query", stage, request = %self.criteria[stage].query_request());
            self.client
                .query(request)
                .await
                .map_err(|source| SequenceError::Query { stage, source })?
        } else {
            debug!(message = "no keys left to look up", stage);
            SearchResponse::default()
        };

        if response.timed_out {
            return Ok(self.time_out(stage));
        }
        Ok(self.base_criterion(stage, response.hits))
    }

    fn base_criterion(&mut self, stage: usize, raw: Vec<SearchHit>) -> Step {
        let full = raw.len() >= self.criteria[stage].query_request().size();
        let hits = self.positioned(stage, raw);
        let first_run = std::mem::replace(&mut self.first_run, false);

        if hits.is_empty() {
            if first_run
                && self.matcher.first_positive_stage() == self.matcher.last_positive_stage()
            {
                debug!(message = "base stage has no hits", stage);
                return Step::Payload;
            }
            return Step::CompleteBase {
                stage,
                hits,
                full: false,
                window: None,
            };
        }

        let head = hits[0].0.clone();
        let tail = hits[hits.len() - 1].0.clone();
        let (begin, end) = if self.criteria[stage].descending() {
            (tail.clone(), head)
        } else {
            (head, tail.clone())
        };
        self.criteria[stage]
            .query_request_mut()
            .next_after(tail);

        let window = WindowInfo {
            base_stage: stage,
            begin,
            end,
        };
        debug!(message = "window discovered", stage, hits = hits.len(), full, window = %window);

        let then = Step::CompleteBase {
            stage,
            hits,
            full,
            window: Some(window.clone()),
        };
        if self.until.is_some() {
            Step::Until {
                window,
                then: Box::new(then),
            }
        } else {
            then
        }
    }

    fn complete_base(
        &mut self,
        stage: usize,
        hits: Hits,
        full: bool,
        window: Option<WindowInfo>,
    ) -> Step {
        let entries = self.wrap(stage, &hits);
        if !self.matcher.match_stage(stage, entries) {
            return Step::Payload;
        }

        let first = self.matcher.first_positive_stage();
        let descending = self.criteria[stage].descending();

        let Some(next) = self.matcher.next_positive_stage(stage) else {
            return if full {
                Step::Tumble(stage)
            } else if self.tail && stage != first {
                Step::Tumble(first)
            } else {
                Step::after_missing_events(Step::Payload)
            };
        };

        if let Some(window) = &window {
            if descending {
                // later stages continue ascending from the oldest base hit
                let request = self.criteria[next].query_request_mut();
                request.set_from(Some(window.begin.clone()));
                request.set_to(None);
                request.reset_after();
                for later in &mut self.criteria[next + 1..] {
                    let request = later.query_request_mut();
                    request.set_from(None);
                    request.set_to(None);
                    request.reset_after();
                }
            } else {
                self.box_query(next, window);
            }
        }

        if !full {
            if !self.matcher.has_following_candidates(stage) {
                if self.tail && stage != first {
                    Step::Tumble(first)
                } else {
                    Step::after_missing_events(Step::Payload)
                }
            } else {
                Step::Rebase(next)
            }
        } else if descending {
            Step::Rebase(next)
        } else {
            Step::Secondary {
                window: window.expect("a full page always yields a window"),
                stage: next,
            }
        }
    }

    async fn secondary(&mut self, window: WindowInfo, stage: usize) -> Result<Step, SequenceError> {
        self.box_query(stage, &window);
        if self.deadline_passed() {
            return Ok(self.time_out(stage));
        }

        let response = if self.apply_keys(stage) {
            let request = self.criteria[stage]
                .query_request()
                .to_search_request(Some(self.remaining()));
            trace!(message = "secondary query", stage, request = %self.criteria[stage].query_request());
            self.client
                .query(request)
                .await
                .map_err(|source| SequenceError::Query { stage, source })?
        } else {
            SearchResponse::default()
        };

        if response.timed_out {
            return Ok(self.time_out(stage));
        }

        let size = self.criteria[stage].query_request().size();
        let returned = response.hits.len();
        let mut hits = self.positioned(stage, response.hits);
        let positioned = hits.len();
        hits.retain(|(ordinal, _)| ordinal <= &window.end);
        let exhausted = returned < size || hits.len() < positioned;

        debug!(
            message = "secondary stage",
            stage,
            hits = hits.len(),
            trimmed = positioned - hits.len(),
            window = %window
        );

        let head = hits.first().map(|(o, _)| o.clone());
        if let Some((tail, _)) = hits.last() {
            self.criteria[stage]
                .query_request_mut()
                .next_after(tail.clone());
        }

        let entries = self.wrap(stage, &hits);
        if !self.matcher.match_stage(stage, entries) {
            return Ok(Step::Payload);
        }

        let next = self.matcher.next_positive_stage(stage);
        if let (Some(next), Some(head)) = (next, head) {
            let request = self.criteria[next].query_request_mut();
            if request.from().is_none() || request.after().is_none() {
                request.set_from(Some(head.clone()));
                request.next_after(head);
            }
        }

        let inside = self.criteria[stage]
            .query_request()
            .after()
            .map(|after| after < &window.end)
            .unwrap_or(false);

        if !exhausted && inside {
            return Ok(Step::Secondary { window, stage });
        }

        Ok(match next {
            Some(next) if self.matcher.has_following_candidates(stage) => {
                Step::Secondary { window, stage: next }
            }
            _ => Step::Tumble(window.base_stage),
        })
    }

    async fn until_check(&mut self, window: WindowInfo, then: Step) -> Result<Step, SequenceError> {
        let Some(mut until) = self.until.take() else {
            return Ok(then);
        };
        let result = self.query_until(&mut until, window, then).await;
        self.until = Some(until);
        result
    }

    async fn query_until(
        &mut self,
        until: &mut SequenceCriterion,
        window: WindowInfo,
        then: Step,
    ) -> Result<Step, SequenceError> {
        let stage = until.stage();
        let request = until.query_request_mut();
        if request.from().is_none() {
            request.set_from(Some(window.begin.clone()));
        }
        request.set_to(Some(window.end.clone()));
        if request.after().map(|a| a > &window.end).unwrap_or(false) {
            return Ok(then);
        }

        if self.deadline_passed() {
            return Ok(self.time_out(stage));
        }

        let size = request.size();
        let search = request.to_search_request(Some(self.remaining()));
        let response = self
            .client
            .query(search)
            .await
            .map_err(SequenceError::Until)?;

        if response.timed_out {
            return Ok(self.time_out(stage));
        }

        let returned = response.hits.len();
        let mut hits: Vec<(Ordinal, &SearchHit)> = response
            .hits
            .iter()
            .filter_map(|hit| Some((until.ordinal(hit)?, hit)))
            .collect();
        let positioned = hits.len();
        hits.retain(|(ordinal, _)| ordinal <= &window.end);
        let exhausted = returned < size || hits.len() < positioned;

        let mut markers = Vec::with_capacity(hits.len());
        for (ordinal, hit) in &hits {
            for key in until.keys(hit, &mut self.key_cache) {
                markers.push(KeyAndOrdinal::new(key, ordinal.clone()));
            }
        }
        debug!(message = "until markers", markers = markers.len(), window = %window);
        self.matcher.until(markers);

        if let Some((last, _)) = hits.last() {
            until.query_request_mut().next_after(last.clone());
        }

        let inside = until
            .query_request()
            .after()
            .map(|a| a < &window.end)
            .unwrap_or(false);

        if !exhausted && inside {
            Ok(Step::Until {
                window,
                then: Box::new(then),
            })
        } else {
            Ok(then)
        }
    }

    fn box_query(&mut self, stage: usize, window: &WindowInfo) {
        let request = self.criteria[stage].query_request_mut();
        if request.from().is_none() {
            request.set_from(Some(window.begin.clone()));
        }
        request.set_to(Some(window.end.clone()));
    }

    /// Constrains `stage` to the keys still in flight at its previous positive
    /// stage. Returns false when no key is left, so no hit could match.
    fn apply_keys(&mut self, stage: usize) -> bool {
        let keys = if self.has_keys {
            self.matcher
                .previous_positive_stage(stage)
                .map(|previous| self.matcher.keys(Some(previous)))
        } else {
            None
        };

        let request = self.criteria[stage].query_request_mut();
        match keys {
            Some(keys) if keys.is_empty() => false,
            Some(keys) => {
                request.set_keys(keys);
                true
            }
            None => {
                request.set_keys(vec![]);
                true
            }
        }
    }

    fn positioned(&self, stage: usize, hits: Vec<SearchHit>) -> Hits {
        let criterion = &self.criteria[stage];
        hits.into_iter()
            .filter_map(|hit| match criterion.ordinal(&hit) {
                Some(ordinal) => Some((ordinal, hit)),
                None => {
                    warn!(message = "hit without ordinal", stage, index = %hit.index, id = %hit.id);
                    None
                }
            })
            .collect()
    }

    fn wrap(&mut self, stage: usize, hits: &Hits) -> Vec<(KeyAndOrdinal, HitReference)> {
        let criterion = &self.criteria[stage];
        let mut entries = Vec::with_capacity(hits.len());
        for (ordinal, hit) in hits {
            for key in criterion.keys(hit, &mut self.key_cache) {
                entries.push((KeyAndOrdinal::new(key, ordinal.clone()), hit.reference()));
            }
        }
        entries
    }

    fn limit_reached(&self) -> bool {
        self.limit
            .map(|limit| self.matcher.completed().len() >= limit)
            .unwrap_or(false)
    }

    fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    fn deadline_passed(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    fn time_out(&mut self, stage: usize) -> Step {
        info!(
            message = "sequence window timed out",
            stage,
            completed = self.matcher.completed().len(),
            elapsed_ms = self.start.elapsed().as_millis() as u64
        );
        self.timed_out = true;
        Step::Payload
    }

    async fn payload(&mut self) -> Result<Payload, SequenceError> {
        let mut completed = self.matcher.completed().to_vec();
        completed.sort_by(|a, b| a.start_ordinal().cmp(b.start_ordinal()));
        if let Some(limit) = self.limit {
            if completed.len() > limit {
                if self.tail {
                    completed.drain(..completed.len() - limit);
                } else {
                    completed.truncate(limit);
                }
            }
        }

        if completed.is_empty() {
            return Ok(Payload::empty(self.timed_out, self.start.elapsed()));
        }

        let refs = completed.iter().map(|s| s.hit_references()).collect();
        let fetched = self
            .client
            .fetch_hits(refs)
            .await
            .map_err(SequenceError::FetchHits)?;

        Payload::assemble(&completed, fetched, self.timed_out, self.start.elapsed())
    }
}
