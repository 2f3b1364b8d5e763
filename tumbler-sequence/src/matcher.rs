use crate::errors::{invalid, SequenceError};
use crate::sequence::Sequence;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::ops::Bound;
use std::time::Duration;
use tracing::trace;
use tumbler_types::{HitReference, Ordinal, SequenceKey, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyAndOrdinal {
    pub key: SequenceKey,
    pub ordinal: Ordinal,
}

impl KeyAndOrdinal {
    pub fn new(key: SequenceKey, ordinal: Ordinal) -> Self {
        KeyAndOrdinal { key, ordinal }
    }
}

/// Where a missing-designated stage sits relative to the positive stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPosition {
    /// Before the first positive stage.
    Leading,
    /// Between two positive stages.
    Middle,
    /// After the last positive stage.
    Trailing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherStats {
    pub seen: u64,
    pub ignored: u64,
    pub rejected_max_span: u64,
    pub rejected_until: u64,
    pub evicted: u64,
    pub completed: u64,
    pub discarded: u64,
}

impl Display for MatcherStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seen={} ignored={} maxspan={} until={} evicted={} completed={} discarded={}",
            self.seen,
            self.ignored,
            self.rejected_max_span,
            self.rejected_until,
            self.evicted,
            self.completed,
            self.discarded
        )
    }
}

/// In-flight sequences of one key at one stage, ordered by their last ordinal.
#[derive(Debug, Default)]
struct SequenceGroup {
    sequences: Vec<Sequence>,
}

impl SequenceGroup {
    fn add(&mut self, sequence: Sequence) {
        let pos = self
            .sequences
            .partition_point(|s| s.ordinal() <= sequence.ordinal());
        self.sequences.insert(pos, sequence);
    }

    /// Removes and returns the latest sequence strictly before `ordinal`.
    /// Older ones are dropped too: any later hit prefers the latest start.
    fn take_before(&mut self, ordinal: &Ordinal) -> Option<Sequence> {
        let pos = self.sequences.partition_point(|s| s.ordinal() < ordinal);
        if pos == 0 {
            return None;
        }
        let found = self.sequences.remove(pos - 1);
        self.sequences.drain(..pos - 1);
        Some(found)
    }

    /// Keeps only the latest sequence at or before `ordinal`, plus any after it.
    fn trim_to(&mut self, ordinal: &Ordinal) {
        let pos = self.sequences.partition_point(|s| s.ordinal() <= ordinal);
        if pos > 1 {
            self.sequences.drain(..pos - 1);
        }
    }

    fn evict_oldest(&mut self) -> Option<Sequence> {
        if self.sequences.is_empty() {
            None
        } else {
            Some(self.sequences.remove(0))
        }
    }

    fn len(&self) -> usize {
        self.sequences.len()
    }

    fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    fn min_ordinal(&self) -> Option<&Ordinal> {
        self.sequences.first().map(|s| s.ordinal())
    }
}

/// Partition-keyed state machine behind the window: tracks per key and stage
/// the partial sequences, extends them as later stages match and collects the
/// completed ones.
///
/// Owned by a single window; nothing here is shared.
pub struct SequenceMatcher {
    stages: usize,
    missing: Vec<bool>,
    first_positive: usize,
    last_positive: usize,
    max_span_nanos: Option<i64>,
    limit: Option<usize>,
    max_candidates_per_key: usize,
    // stage -> key -> sequences whose last match is that stage
    candidates: Vec<HashMap<SequenceKey, SequenceGroup>>,
    until: HashMap<SequenceKey, BTreeSet<Ordinal>>,
    // descending bases only: stage -> key -> earliest match, across all pages
    claimed: Option<Vec<HashMap<SequenceKey, Ordinal>>>,
    // `claimed` as of the last sealed page
    sealed: Vec<HashMap<SequenceKey, Ordinal>>,
    completed: Vec<Sequence>,
    to_check: Vec<Sequence>,
    stats: MatcherStats,
}

impl SequenceMatcher {
    pub fn new(
        missing: Vec<bool>,
        max_span: Option<Duration>,
        limit: Option<usize>,
        max_candidates_per_key: usize,
    ) -> Result<Self, SequenceError> {
        let first_positive = missing
            .iter()
            .position(|m| !m)
            .ok_or_else(|| invalid("a sequence needs at least one non-missing stage"))?;
        let last_positive = missing
            .iter()
            .rposition(|m| !m)
            .ok_or_else(|| invalid("a sequence needs at least one non-missing stage"))?;

        let stages = missing.len();
        Ok(SequenceMatcher {
            stages,
            missing,
            first_positive,
            last_positive,
            max_span_nanos: max_span.map(|d| d.as_nanos() as i64).filter(|n| *n > 0),
            limit,
            max_candidates_per_key: max_candidates_per_key.max(1),
            candidates: (0..stages).map(|_| HashMap::new()).collect(),
            until: HashMap::new(),
            claimed: None,
            sealed: vec![],
            completed: vec![],
            to_check: vec![],
            stats: MatcherStats::default(),
        })
    }

    /// Tracks the base stage page by page, newest page first. See
    /// [`SequenceMatcher::seal_page`].
    pub fn with_descending_pages(mut self) -> Self {
        self.claimed = Some((0..self.stages).map(|_| HashMap::new()).collect());
        self
    }

    /// Closes a page of a descending base. Every later page lies before it, so
    /// a hit of the next page that falls after the earliest match of its key
    /// at the previous stage already had its chance against a newer sequence
    /// and is ignored.
    pub fn seal_page(&mut self) {
        if let Some(claimed) = &self.claimed {
            self.sealed = claimed.clone();
        }
    }

    fn claim(&mut self, stage: usize, key: &SequenceKey, ordinal: &Ordinal) {
        let Some(claimed) = self.claimed.as_mut() else {
            return;
        };
        let earliest = claimed[stage]
            .entry(key.clone())
            .or_insert_with(|| ordinal.clone());
        if *ordinal < *earliest {
            *earliest = ordinal.clone();
        }
    }

    fn claimed_by_sealed_page(&self, stage: usize, ko: &KeyAndOrdinal) -> bool {
        self.sealed
            .get(stage)
            .and_then(|keys| keys.get(&ko.key))
            .map(|earliest| &ko.ordinal > earliest)
            .unwrap_or(false)
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn first_positive_stage(&self) -> usize {
        self.first_positive
    }

    pub fn last_positive_stage(&self) -> usize {
        self.last_positive
    }

    pub fn is_missing_event(&self, stage: usize) -> bool {
        self.missing[stage]
    }

    pub fn has_missing_events(&self) -> bool {
        self.missing.iter().any(|m| *m)
    }

    pub fn missing_position(&self, stage: usize) -> Option<MissingPosition> {
        if !self.missing[stage] {
            None
        } else if stage < self.first_positive {
            Some(MissingPosition::Leading)
        } else if stage > self.last_positive {
            Some(MissingPosition::Trailing)
        } else {
            Some(MissingPosition::Middle)
        }
    }

    pub fn next_positive_stage(&self, stage: usize) -> Option<usize> {
        (stage + 1..self.stages).find(|s| !self.missing[*s])
    }

    pub fn previous_positive_stage(&self, stage: usize) -> Option<usize> {
        (0..stage.min(self.stages)).rev().find(|s| !self.missing[*s])
    }

    pub fn exceeds_max_span(&self, from: Timestamp, to: Timestamp) -> bool {
        self.max_span_nanos
            .map(|span| to.delta(&from) > span)
            .unwrap_or(false)
    }

    /// Feeds the hits of `stage`. Returns false once the result limit is
    /// reached, telling the window to stop querying.
    pub fn match_stage<I>(&mut self, stage: usize, hits: I) -> bool
    where
        I: IntoIterator<Item = (KeyAndOrdinal, HitReference)>,
    {
        assert!(!self.missing[stage], "stage {} is missing-designated", stage);
        if self.limit_reached() {
            return false;
        }

        for (ko, hit) in hits {
            self.stats.seen += 1;
            if stage == self.first_positive {
                self.start(stage, ko, hit);
            } else {
                self.extend(stage, ko, hit);
            }

            if self.limit_reached() {
                trace!(message = "result limit reached", stage, completed = self.completed.len());
                return false;
            }
        }
        true
    }

    fn start(&mut self, stage: usize, ko: KeyAndOrdinal, hit: HitReference) {
        self.claim(stage, &ko.key, &ko.ordinal);
        let sequence = Sequence::new(ko.key, self.stages, stage, ko.ordinal, hit);
        if stage == self.last_positive {
            self.complete(sequence);
        } else {
            self.track(stage, sequence);
        }
    }

    fn extend(&mut self, stage: usize, ko: KeyAndOrdinal, hit: HitReference) {
        let previous = self
            .previous_positive_stage(stage)
            .expect("a later positive stage has a predecessor");

        if self.claimed_by_sealed_page(previous, &ko) {
            self.stats.ignored += 1;
            return;
        }

        let Some(group) = self.candidates[previous].get_mut(&ko.key) else {
            self.stats.ignored += 1;
            return;
        };
        let taken = group.take_before(&ko.ordinal);
        if group.is_empty() {
            self.candidates[previous].remove(&ko.key);
        }
        let Some(mut sequence) = taken else {
            self.stats.ignored += 1;
            return;
        };

        if self.exceeds_max_span(sequence.start_timestamp(), ko.ordinal.timestamp()) {
            self.stats.rejected_max_span += 1;
            return;
        }

        if self.crosses_until(&ko.key, sequence.ordinal(), &ko.ordinal) {
            self.stats.rejected_until += 1;
            return;
        }

        self.claim(stage, &ko.key, &ko.ordinal);
        sequence.put_match(stage, ko.ordinal, hit);
        if stage == self.last_positive {
            self.complete(sequence);
        } else {
            self.track(stage, sequence);
        }
    }

    fn track(&mut self, stage: usize, sequence: Sequence) {
        let group = self.candidates[stage]
            .entry(sequence.key().clone())
            .or_default();
        group.add(sequence);
        if group.len() > self.max_candidates_per_key {
            group.evict_oldest();
            self.stats.evicted += 1;
        }
    }

    fn complete(&mut self, sequence: Sequence) {
        if self.has_missing_events() {
            self.to_check.push(sequence);
        } else {
            self.add_to_completed(sequence);
        }
    }

    fn crosses_until(&self, key: &SequenceKey, last: &Ordinal, next: &Ordinal) -> bool {
        if last >= next {
            return false;
        }
        self.until
            .get(key)
            .map(|markers| {
                markers
                    .range::<Ordinal, _>((Bound::Excluded(last), Bound::Excluded(next)))
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// Records until-condition hits. A sequence is never extended across a
    /// marker of its key.
    pub fn until<I>(&mut self, markers: I)
    where
        I: IntoIterator<Item = KeyAndOrdinal>,
    {
        for marker in markers {
            self.until.entry(marker.key).or_default().insert(marker.ordinal);
        }
    }

    /// Drops state that cannot influence hits past `ordinal`; `None` discards
    /// every in-flight sequence.
    pub fn trim(&mut self, ordinal: Option<&Ordinal>) {
        let Some(ordinal) = ordinal else {
            for stage in &mut self.candidates {
                stage.clear();
            }
            self.until.clear();
            return;
        };

        let span = self.max_span_nanos;
        let mut dropped = 0;
        for stage in &mut self.candidates {
            for group in stage.values_mut() {
                let before = group.len();
                group.trim_to(ordinal);
                if let Some(span) = span {
                    group
                        .sequences
                        .retain(|s| ordinal.timestamp().delta(&s.start_timestamp()) <= span);
                }
                dropped += before - group.len();
            }
            stage.retain(|_, group| !group.is_empty());
        }

        let candidates = &self.candidates;
        self.until.retain(|key, markers| {
            let floor = candidates
                .iter()
                .filter_map(|stage| stage.get(key).and_then(SequenceGroup::min_ordinal))
                .min();
            match floor {
                Some(floor) => markers.retain(|m| m > floor),
                None => markers.retain(|m| m >= ordinal),
            }
            !markers.is_empty()
        });

        trace!(message = "trimmed matcher", ordinal = %ordinal, dropped);
    }

    /// Drains the sequences waiting on a missing-event verification.
    pub fn to_check_for_missing(&mut self) -> Vec<Sequence> {
        std::mem::take(&mut self.to_check)
    }

    pub fn add_to_completed(&mut self, sequence: Sequence) {
        self.stats.completed += 1;
        self.completed.push(sequence);
    }

    pub fn discard(&mut self, _sequence: Sequence) {
        self.stats.discarded += 1;
    }

    pub fn completed(&self) -> &[Sequence] {
        &self.completed
    }

    pub fn limit_reached(&self) -> bool {
        self.limit
            .map(|limit| self.completed.len() >= limit)
            .unwrap_or(false)
    }

    pub fn has_candidates(&self) -> bool {
        self.has_following_candidates(0)
    }

    /// Whether any in-flight sequence has progressed to `stage` or beyond.
    pub fn has_following_candidates(&self, stage: usize) -> bool {
        self.candidates
            .iter()
            .skip(stage)
            .any(|groups| !groups.is_empty())
    }

    /// Keys of the in-flight sequences at `stage`, or at any stage for `None`.
    pub fn keys(&self, stage: Option<usize>) -> Vec<SequenceKey> {
        let keys: BTreeSet<&SequenceKey> = match stage {
            Some(stage) => self.candidates[stage].keys().collect(),
            None => self.candidates.iter().flat_map(|s| s.keys()).collect(),
        };
        keys.into_iter().cloned().collect()
    }

    pub fn stats(&self) -> &MatcherStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        for stage in &mut self.candidates {
            stage.clear();
        }
        self.until.clear();
        if let Some(claimed) = &mut self.claimed {
            claimed.iter_mut().for_each(HashMap::clear);
        }
        self.sealed.clear();
        self.completed.clear();
        self.to_check.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use tumbler_types::KeyComponent;

    fn ordinal(millis: i64) -> Ordinal {
        Ordinal::new(Timestamp::from_millis(millis), None, 0)
    }

    fn key(s: &str) -> SequenceKey {
        SequenceKey::new(vec![KeyComponent::Text(Arc::from(s))])
    }

    fn hits(k: &SequenceKey, millis: &[i64]) -> Vec<(KeyAndOrdinal, HitReference)> {
        millis
            .iter()
            .map(|m| {
                (
                    KeyAndOrdinal::new(k.clone(), ordinal(*m)),
                    HitReference::new("logs", m.to_string()),
                )
            })
            .collect()
    }

    fn matcher(missing: Vec<bool>) -> SequenceMatcher {
        SequenceMatcher::new(missing, None, None, 100).unwrap()
    }

    fn stage_ordinals(seq: &Sequence) -> Vec<Option<i64>> {
        (0..seq.stages())
            .map(|s| seq.matched(s).map(|m| m.ordinal.timestamp().as_millis()))
            .collect()
    }

    #[test]
    fn test_extends_latest_preceding_sequence() {
        let mut m = matcher(vec![false, false]);
        let k = key("h");
        assert!(m.match_stage(0, hits(&k, &[10, 20, 30])));
        assert!(m.has_candidates());
        assert!(m.match_stage(1, hits(&k, &[15, 25])));

        let completed: Vec<_> = m.completed().iter().map(stage_ordinals).collect();
        assert_eq!(
            completed,
            vec![vec![Some(10), Some(15)], vec![Some(20), Some(25)]]
        );
        assert_eq!(m.keys(Some(0)), vec![k]);
    }

    #[test]
    fn test_later_hit_supersedes_older_starts() {
        let mut m = matcher(vec![false, false]);
        let k = key("h");
        m.match_stage(0, hits(&k, &[10, 20, 30]));
        m.match_stage(1, hits(&k, &[35]));
        assert_eq!(m.completed().len(), 1);
        assert_eq!(stage_ordinals(&m.completed()[0]), vec![Some(30), Some(35)]);
        assert!(!m.has_candidates());
        assert_eq!(m.stats().seen, 4);
    }

    #[test]
    fn test_keys_partition_matches() {
        let mut m = matcher(vec![false, false]);
        m.match_stage(0, hits(&key("a"), &[10]));
        m.match_stage(1, hits(&key("b"), &[20]));
        assert!(m.completed().is_empty());
        assert_eq!(m.stats().ignored, 1);
        m.match_stage(1, hits(&key("a"), &[20]));
        assert_eq!(m.completed()[0].key(), &key("a"));
    }

    #[test]
    fn test_until_marker_breaks_sequence() {
        let mut m = matcher(vec![false, false]);
        let k = key("h");
        m.match_stage(0, hits(&k, &[10, 50]));
        m.until(vec![KeyAndOrdinal::new(k.clone(), ordinal(20))]);
        m.match_stage(1, hits(&k, &[30]));
        assert!(m.completed().is_empty());
        assert_eq!(m.stats().rejected_until, 1);

        m.match_stage(1, hits(&k, &[60]));
        assert_eq!(stage_ordinals(&m.completed()[0]), vec![Some(50), Some(60)]);
    }

    #[test]
    fn test_max_span() {
        let mut m = SequenceMatcher::new(vec![false, false], Some(Duration::from_millis(10)), None, 100)
            .unwrap();
        let k = key("h");
        m.match_stage(0, hits(&k, &[10]));
        m.match_stage(1, hits(&k, &[21]));
        assert_eq!(m.stats().rejected_max_span, 1);
        m.match_stage(0, hits(&k, &[30]));
        m.match_stage(1, hits(&k, &[40]));
        assert_eq!(m.completed().len(), 1);
        assert!(m.exceeds_max_span(Timestamp::from_millis(0), Timestamp::from_millis(11)));
        assert!(!m.exceeds_max_span(Timestamp::from_millis(0), Timestamp::from_millis(10)));
    }

    #[test]
    fn test_limit_stops_matching() {
        let mut m = SequenceMatcher::new(vec![false], None, Some(2), 100).unwrap();
        assert!(!m.match_stage(0, hits(&key("h"), &[1, 2, 3])));
        assert_eq!(m.completed().len(), 2);
        assert!(m.limit_reached());
        assert!(!m.match_stage(0, hits(&key("h"), &[4])));
    }

    #[test]
    fn test_trim_keeps_latest_candidate() {
        let mut m = matcher(vec![false, false, false]);
        let k = key("h");
        m.match_stage(0, hits(&k, &[10, 20, 30, 40]));
        m.trim(Some(&ordinal(30)));
        m.match_stage(1, hits(&k, &[45]));
        m.match_stage(2, hits(&k, &[50]));
        assert_eq!(stage_ordinals(&m.completed()[0]), vec![Some(40), Some(45), Some(50)]);

        m.match_stage(0, hits(&k, &[60, 70]));
        m.trim(Some(&ordinal(80)));
        m.match_stage(1, hits(&k, &[90]));
        assert_eq!(m.keys(Some(1)), vec![k.clone()]);
        assert!(m.keys(Some(0)).is_empty());

        m.trim(None);
        assert!(!m.has_candidates());
        assert_eq!(m.completed().len(), 1);
    }

    #[test]
    fn test_candidates_per_key_are_bounded() {
        let mut m = SequenceMatcher::new(vec![false, false], None, None, 2).unwrap();
        let k = key("h");
        m.match_stage(0, hits(&k, &[10, 20, 30]));
        assert_eq!(m.stats().evicted, 1);
        m.match_stage(1, hits(&k, &[15]));
        assert!(m.completed().is_empty());
    }

    #[test]
    fn test_missing_stages() {
        let mut m = matcher(vec![true, false, true, false, true]);
        assert_eq!(m.first_positive_stage(), 1);
        assert_eq!(m.last_positive_stage(), 3);
        assert_eq!(m.next_positive_stage(1), Some(3));
        assert_eq!(m.previous_positive_stage(3), Some(1));
        assert_eq!(m.next_positive_stage(3), None);
        assert_eq!(m.missing_position(0), Some(MissingPosition::Leading));
        assert_eq!(m.missing_position(2), Some(MissingPosition::Middle));
        assert_eq!(m.missing_position(4), Some(MissingPosition::Trailing));
        assert_eq!(m.missing_position(3), None);

        let k = key("h");
        m.match_stage(1, hits(&k, &[10]));
        m.match_stage(3, hits(&k, &[20]));
        assert!(m.completed().is_empty());
        let pending = m.to_check_for_missing();
        assert_eq!(pending.len(), 1);
        assert!(m.to_check_for_missing().is_empty());
    }

    #[test]
    fn test_sealed_pages_keep_later_hits() {
        let mut m = matcher(vec![false, false, false]).with_descending_pages();
        let (h, g) = (key("h"), key("g"));

        // newest page
        m.match_stage(0, hits(&h, &[100]));
        m.match_stage(1, hits(&h, &[110]));
        m.match_stage(2, hits(&h, &[150]));
        m.seal_page();
        m.trim(None);

        // older page: 110 and 150 went to the newer sequence, 90 and 95 did not
        m.match_stage(0, hits(&h, &[70]));
        m.match_stage(0, hits(&g, &[70]));
        m.match_stage(1, hits(&h, &[80, 110]));
        m.match_stage(1, hits(&g, &[110]));
        m.match_stage(2, hits(&h, &[95, 150]));
        m.match_stage(2, hits(&g, &[150]));

        let mut completed: Vec<_> = m
            .completed()
            .iter()
            .map(|s| (s.key().clone(), stage_ordinals(s)))
            .collect();
        completed.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            completed,
            vec![
                (h.clone(), vec![Some(70), Some(80), Some(95)]),
                (g, vec![Some(70), Some(110), Some(150)]),
                (h, vec![Some(100), Some(110), Some(150)]),
            ]
        );
        assert_eq!(m.stats().ignored, 2);
    }

    #[test]
    fn test_rejects_all_missing() {
        assert!(SequenceMatcher::new(vec![true, true], None, None, 1).is_err());
    }
}
