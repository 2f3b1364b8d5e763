use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};

pub mod key;

pub use key::{extract_keys, KeyCache, KeyComponent, SequenceKey};

pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Event time with nanosecond resolution, counted from the unix epoch.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    nanos: i64,
}

impl Timestamp {
    pub fn from_nanos(nanos: i64) -> Self {
        Timestamp { nanos }
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp {
            nanos: millis.saturating_mul(NANOS_PER_MILLI),
        }
    }

    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    pub fn as_millis(&self) -> i64 {
        self.nanos / NANOS_PER_MILLI
    }

    /// Nanoseconds elapsed from `earlier` to `self`; negative if `earlier` is later.
    pub fn delta(&self, earlier: &Timestamp) -> i64 {
        self.nanos.saturating_sub(earlier.nanos)
    }

    /// Reads a timestamp out of a document field. Numbers are epoch millis,
    /// strings are either RFC 3339 or numeric millis.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(millis) = n.as_i64() {
                    Some(Timestamp::from_millis(millis))
                } else {
                    n.as_f64()
                        .map(|millis| Timestamp::from_nanos((millis * NANOS_PER_MILLI as f64) as i64))
                }
            }
            Value::String(s) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    return dt.timestamp_nanos_opt().map(Timestamp::from_nanos);
                }
                s.parse::<i64>().ok().map(Timestamp::from_millis)
            }
            Value::Array(values) if values.len() == 1 => Timestamp::from_value(&values[0]),
            _ => None,
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let millis = self.as_millis();
        let sub_millis = self.nanos % NANOS_PER_MILLI;
        if sub_millis == 0 {
            write!(f, "{}", millis)
        } else {
            write!(f, "{}.{:06}", millis, sub_millis.abs())
        }
    }
}

/// User supplied secondary sort value. All hits of one sequence run share a
/// single tiebreaker type; comparing a number against a string is a bug.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tiebreaker {
    Long(i64),
    Text(String),
}

impl Tiebreaker {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Tiebreaker::Long),
            Value::String(s) => Some(Tiebreaker::Text(s.clone())),
            Value::Array(values) if values.len() == 1 => Tiebreaker::from_value(&values[0]),
            _ => None,
        }
    }
}

impl PartialOrd for Tiebreaker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tiebreaker {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Tiebreaker::Long(a), Tiebreaker::Long(b)) => a.cmp(b),
            (Tiebreaker::Text(a), Tiebreaker::Text(b)) => a.cmp(b),
            (a, b) => panic!("cannot compare tiebreakers of different types: {:?} and {:?}", a, b),
        }
    }
}

/// Total position of a hit: `(timestamp, tiebreaker, implicit tiebreaker)`.
///
/// The implicit tiebreaker is the storage order of the document and only
/// decides between hits that agree on both user visible components.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ordinal {
    timestamp: Timestamp,
    tiebreaker: Option<Tiebreaker>,
    implicit_tiebreaker: u64,
}

impl Ordinal {
    pub fn new(timestamp: Timestamp, tiebreaker: Option<Tiebreaker>, implicit_tiebreaker: u64) -> Self {
        Ordinal {
            timestamp,
            tiebreaker,
            implicit_tiebreaker,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn tiebreaker(&self) -> Option<&Tiebreaker> {
        self.tiebreaker.as_ref()
    }

    pub fn implicit_tiebreaker(&self) -> u64 {
        self.implicit_tiebreaker
    }

    pub fn before(&self, other: &Ordinal) -> bool {
        self < other
    }

    pub fn after(&self, other: &Ordinal) -> bool {
        self > other
    }

    pub fn between(&self, lower: &Ordinal, upper: &Ordinal) -> bool {
        lower <= self && self <= upper
    }
}

impl PartialOrd for Ordinal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// A missing tiebreaker sorts before any present one.
impl Ord for Ordinal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.tiebreaker.cmp(&other.tiebreaker))
            .then_with(|| self.implicit_tiebreaker.cmp(&other.implicit_tiebreaker))
    }
}

impl Display for Ordinal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.tiebreaker {
            Some(Tiebreaker::Long(t)) => write!(f, "[{}, {}, {}]", self.timestamp, t, self.implicit_tiebreaker),
            Some(Tiebreaker::Text(t)) => write!(f, "[{}, {}, {}]", self.timestamp, t, self.implicit_tiebreaker),
            None => write!(f, "[{}, {}]", self.timestamp, self.implicit_tiebreaker),
        }
    }
}

/// Lazy pointer to a stored document, resolved into a [`SearchHit`] only when
/// the final payload is assembled.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HitReference {
    pub index: String,
    pub id: String,
}

impl HitReference {
    pub fn new(index: impl Into<String>, id: impl Into<String>) -> Self {
        HitReference {
            index: index.into(),
            id: id.into(),
        }
    }
}

/// A raw document as returned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    /// Storage order, used as the implicit tiebreaker.
    pub seq_no: u64,
    pub source: Value,
}

impl SearchHit {
    pub fn new(index: impl Into<String>, id: impl Into<String>, seq_no: u64, source: Value) -> Self {
        SearchHit {
            index: index.into(),
            id: id.into(),
            seq_no,
            source,
        }
    }

    pub fn reference(&self) -> HitReference {
        HitReference::new(self.index.clone(), self.id.clone())
    }

    /// Looks up a field by name. A literal key wins over a dotted path, so
    /// both `{"event.type": ..}` and `{"event": {"type": ..}}` resolve.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.source, path)
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    if let Some(v) = object.get(path) {
        return Some(v);
    }
    let (head, rest) = path.split_once('.')?;
    lookup(object.get(head)?, rest)
}

/// Field names needed to position a hit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdinalFields {
    pub timestamp_field: String,
    pub tiebreaker_field: Option<String>,
}

impl OrdinalFields {
    pub fn new(timestamp_field: impl Into<String>, tiebreaker_field: Option<String>) -> Self {
        OrdinalFields {
            timestamp_field: timestamp_field.into(),
            tiebreaker_field,
        }
    }

    pub fn timestamp(&self, hit: &SearchHit) -> Option<Timestamp> {
        hit.field(&self.timestamp_field).and_then(Timestamp::from_value)
    }

    pub fn ordinal(&self, hit: &SearchHit) -> Option<Ordinal> {
        let timestamp = self.timestamp(hit)?;
        let tiebreaker = self
            .tiebreaker_field
            .as_ref()
            .and_then(|field| hit.field(field))
            .and_then(Tiebreaker::from_value);
        Some(Ordinal::new(timestamp, tiebreaker, hit.seq_no))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn ordinal(millis: i64, tiebreaker: Option<i64>, implicit: u64) -> Ordinal {
        Ordinal::new(Timestamp::from_millis(millis), tiebreaker.map(Tiebreaker::Long), implicit)
    }

    #[test]
    fn test_ordinal_order() {
        assert!(ordinal(10, None, 5).before(&ordinal(11, None, 0)));
        assert!(ordinal(10, Some(1), 5).before(&ordinal(10, Some(2), 0)));
        assert!(ordinal(10, Some(2), 1).before(&ordinal(10, Some(2), 2)));
        assert!(ordinal(10, None, 9).before(&ordinal(10, Some(0), 0)));
        assert_eq!(ordinal(10, Some(2), 1), ordinal(10, Some(2), 1));
        assert!(ordinal(20, None, 0).after(&ordinal(10, None, 0)));
        assert!(ordinal(15, None, 0).between(&ordinal(10, None, 0), &ordinal(20, None, 0)));
    }

    #[test]
    #[should_panic]
    fn test_mismatched_tiebreakers_panic() {
        let a = Ordinal::new(Timestamp::from_millis(1), Some(Tiebreaker::Long(1)), 0);
        let b = Ordinal::new(Timestamp::from_millis(1), Some(Tiebreaker::Text("x".into())), 0);
        let _ = a.before(&b);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(Timestamp::from_value(&json!(1500)), Some(Timestamp::from_millis(1500)));
        assert_eq!(Timestamp::from_value(&json!("1500")), Some(Timestamp::from_millis(1500)));
        assert_eq!(
            Timestamp::from_value(&json!("1970-01-01T00:00:01.5Z")),
            Some(Timestamp::from_millis(1500))
        );
        assert_eq!(Timestamp::from_value(&json!(true)), None);
        assert_eq!(
            Timestamp::from_millis(2000).delta(&Timestamp::from_millis(500)),
            1500 * NANOS_PER_MILLI
        );
    }

    #[test]
    fn test_field_lookup() {
        let hit = SearchHit::new(
            "logs",
            "1",
            0,
            json!({"@timestamp": 5, "event.type": "start", "process": {"name": "sh"}}),
        );
        assert_eq!(hit.field("event.type"), Some(&json!("start")));
        assert_eq!(hit.field("process.name"), Some(&json!("sh")));
        assert_eq!(hit.field("process.pid"), None);

        let fields = OrdinalFields::new("@timestamp", Some("process.name".to_string()));
        assert_eq!(
            fields.ordinal(&hit),
            Some(Ordinal::new(
                Timestamp::from_millis(5),
                Some(Tiebreaker::Text("sh".to_string())),
                0
            ))
        );
    }
}
