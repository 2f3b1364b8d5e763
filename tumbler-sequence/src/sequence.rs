use std::fmt::{Display, Formatter};
use tumbler_types::{HitReference, Ordinal, SequenceKey, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub ordinal: Ordinal,
    pub hit: HitReference,
}

/// The accumulating match of one partition: one slot per stage, filled as
/// stages match. Missing-designated stages stay empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    key: SequenceKey,
    matches: Vec<Option<Match>>,
    first_stage: usize,
    current_stage: usize,
}

impl Sequence {
    pub fn new(key: SequenceKey, stages: usize, stage: usize, ordinal: Ordinal, hit: HitReference) -> Self {
        assert!(stage < stages, "stage {} out of range for {} stages", stage, stages);
        let mut matches = vec![None; stages];
        matches[stage] = Some(Match { ordinal, hit });
        Sequence {
            key,
            matches,
            first_stage: stage,
            current_stage: stage,
        }
    }

    pub fn put_match(&mut self, stage: usize, ordinal: Ordinal, hit: HitReference) {
        assert!(
            stage > self.current_stage,
            "stage {} does not follow stage {}",
            stage,
            self.current_stage
        );
        self.matches[stage] = Some(Match { ordinal, hit });
        self.current_stage = stage;
    }

    pub fn key(&self) -> &SequenceKey {
        &self.key
    }

    pub fn stages(&self) -> usize {
        self.matches.len()
    }

    pub fn matched(&self, stage: usize) -> Option<&Match> {
        self.matches.get(stage).and_then(Option::as_ref)
    }

    /// Ordinal of the first matched stage.
    pub fn start_ordinal(&self) -> &Ordinal {
        &self.head().ordinal
    }

    /// Ordinal of the last matched stage.
    pub fn ordinal(&self) -> &Ordinal {
        &self.tail().ordinal
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ordinal().timestamp()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ordinal().timestamp()
    }

    /// Latest match strictly before `stage`.
    pub fn previous_match(&self, stage: usize) -> Option<&Match> {
        self.matches[..stage.min(self.matches.len())]
            .iter()
            .rev()
            .find_map(Option::as_ref)
    }

    /// Earliest match strictly after `stage`.
    pub fn next_match(&self, stage: usize) -> Option<&Match> {
        self.matches
            .iter()
            .skip(stage + 1)
            .find_map(Option::as_ref)
    }

    /// References of the matched stages, in stage order.
    pub fn hit_references(&self) -> Vec<HitReference> {
        self.matches
            .iter()
            .flatten()
            .map(|m| m.hit.clone())
            .collect()
    }

    fn head(&self) -> &Match {
        self.matches[self.first_stage]
            .as_ref()
            .expect("first stage is always matched")
    }

    fn tail(&self) -> &Match {
        self.matches[self.current_stage]
            .as_ref()
            .expect("current stage is always matched")
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [", self.key)?;
        for (i, m) in self.matches.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match m {
                Some(m) => write!(f, "{}", m.ordinal)?,
                None => write!(f, "_")?,
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ordinal(millis: i64) -> Ordinal {
        Ordinal::new(Timestamp::from_millis(millis), None, 0)
    }

    fn hit(id: &str) -> HitReference {
        HitReference::new("logs", id)
    }

    #[test]
    fn test_sequence_progress() {
        let mut seq = Sequence::new(SequenceKey::NONE, 4, 1, ordinal(10), hit("a"));
        assert_eq!(seq.start_ordinal(), &ordinal(10));
        assert_eq!(seq.ordinal(), &ordinal(10));

        seq.put_match(3, ordinal(30), hit("c"));
        assert_eq!(seq.matched(3).unwrap().ordinal, ordinal(30));
        assert_eq!(seq.start_timestamp(), Timestamp::from_millis(10));
        assert_eq!(seq.timestamp(), Timestamp::from_millis(30));
        assert!(seq.matched(0).is_none());
        assert!(seq.matched(2).is_none());

        assert_eq!(seq.previous_match(2).unwrap().ordinal, ordinal(10));
        assert_eq!(seq.next_match(2).unwrap().ordinal, ordinal(30));
        assert!(seq.previous_match(1).is_none());
        assert_eq!(seq.hit_references(), vec![hit("a"), hit("c")]);
    }

    #[test]
    #[should_panic]
    fn test_out_of_order_match_panics() {
        let mut seq = Sequence::new(SequenceKey::NONE, 3, 1, ordinal(10), hit("a"));
        seq.put_match(0, ordinal(5), hit("b"));
    }
}
