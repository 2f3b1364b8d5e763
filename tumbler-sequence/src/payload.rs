use crate::errors::SequenceError;
use crate::sequence::Sequence;
use anyhow::anyhow;
use serde::Serialize;
use std::time::Duration;
use tumbler_types::{SearchHit, SequenceKey};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceResult {
    pub key: SequenceKey,
    /// One slot per stage; `None` where a stage was missing-designated.
    pub hits: Vec<Option<SearchHit>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub sequences: Vec<SequenceResult>,
    pub timed_out: bool,
    pub took_ms: u64,
}

impl Payload {
    pub fn empty(timed_out: bool, took: Duration) -> Self {
        Payload {
            sequences: vec![],
            timed_out,
            took_ms: took.as_millis() as u64,
        }
    }

    /// Lines fetched documents up with the stages of their sequences.
    /// `fetched[i]` holds the documents of `sequences[i]` in stage order.
    pub fn assemble(
        sequences: &[Sequence],
        fetched: Vec<Vec<SearchHit>>,
        timed_out: bool,
        took: Duration,
    ) -> Result<Self, SequenceError> {
        if sequences.len() != fetched.len() {
            return Err(SequenceError::FetchHits(anyhow!(
                "requested hits for {} sequences but received {}",
                sequences.len(),
                fetched.len()
            )));
        }

        let sequences = sequences
            .iter()
            .zip(fetched)
            .enumerate()
            .map(|(i, (sequence, hits))| {
                let expected = (0..sequence.stages())
                    .filter(|stage| sequence.matched(*stage).is_some())
                    .count();
                if hits.len() != expected {
                    return Err(SequenceError::FetchHits(anyhow!(
                        "sequence {} matched {} hits but {} were fetched",
                        i,
                        expected,
                        hits.len()
                    )));
                }

                let mut hits = hits.into_iter();
                Ok(SequenceResult {
                    key: sequence.key().clone(),
                    hits: (0..sequence.stages())
                        .map(|stage| sequence.matched(stage).and_then(|_| hits.next()))
                        .collect(),
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Payload {
            sequences,
            timed_out,
            took_ms: took.as_millis() as u64,
        })
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use tumbler_types::{HitReference, Ordinal, Timestamp};

    #[test]
    fn test_missing_stages_become_placeholders() {
        let ordinal = |m| Ordinal::new(Timestamp::from_millis(m), None, 0);
        let mut sequence = Sequence::new(SequenceKey::NONE, 3, 0, ordinal(100), HitReference::new("i", "a"));
        sequence.put_match(2, ordinal(500), HitReference::new("i", "b"));

        let fetched = vec![vec![
            SearchHit::new("i", "a", 0, json!({})),
            SearchHit::new("i", "b", 1, json!({})),
        ]];
        let payload =
            Payload::assemble(&[sequence], fetched, false, Duration::from_millis(12)).unwrap();

        assert_eq!(payload.len(), 1);
        let hits = &payload.sequences[0].hits;
        assert_eq!(hits[0].as_ref().unwrap().id, "a");
        assert!(hits[1].is_none());
        assert_eq!(hits[2].as_ref().unwrap().id, "b");
        assert_eq!(payload.took_ms, 12);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["sequences"][0]["hits"][1], serde_json::Value::Null);
        assert_eq!(json["timed_out"], false);
    }

    #[test]
    fn test_misaligned_fetch_is_an_error() {
        let ordinal = |m| Ordinal::new(Timestamp::from_millis(m), None, 0);
        let mut sequence = Sequence::new(SequenceKey::NONE, 2, 0, ordinal(1), HitReference::new("i", "a"));
        sequence.put_match(1, ordinal(2), HitReference::new("i", "b"));
        let took = Duration::from_millis(1);

        let err = Payload::assemble(&[sequence.clone()], vec![], false, took).unwrap_err();
        assert!(matches!(err, SequenceError::FetchHits(_)));

        let short = vec![vec![SearchHit::new("i", "a", 0, json!({}))]];
        let err = Payload::assemble(&[sequence], short, false, took).unwrap_err();
        assert!(matches!(err, SequenceError::FetchHits(_)));
    }
}
