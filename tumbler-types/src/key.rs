use crate::SearchHit;
use lru::LruCache;
use ordered_float::OrderedFloat;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::num::NonZeroUsize;
use std::sync::Arc;

pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 64;

/// One scalar of a join key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyComponent {
    Null,
    Bool(bool),
    Long(i64),
    Double(OrderedFloat<f64>),
    Text(Arc<str>),
}

impl KeyComponent {
    pub fn to_value(&self) -> Value {
        match self {
            KeyComponent::Null => Value::Null,
            KeyComponent::Bool(b) => Value::Bool(*b),
            KeyComponent::Long(l) => Value::from(*l),
            KeyComponent::Double(d) => Value::from(d.0),
            KeyComponent::Text(s) => Value::String(s.to_string()),
        }
    }
}

impl Serialize for KeyComponent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

impl Display for KeyComponent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyComponent::Null => write!(f, "null"),
            KeyComponent::Bool(b) => write!(f, "{}", b),
            KeyComponent::Long(l) => write!(f, "{}", l),
            KeyComponent::Double(d) => write!(f, "{}", d),
            KeyComponent::Text(s) => write!(f, "{}", s),
        }
    }
}

/// The join-key tuple identifying one partition of a sequence run.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SequenceKey(Vec<KeyComponent>);

impl SequenceKey {
    /// The single global partition used when a sequence has no join keys.
    pub const NONE: SequenceKey = SequenceKey(Vec::new());

    pub fn new(components: Vec<KeyComponent>) -> Self {
        SequenceKey(components)
    }

    pub fn components(&self) -> &[KeyComponent] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.0.iter().map(KeyComponent::to_value).collect()
    }
}

impl Display for SequenceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "]")
    }
}

/// Deduplicates string key components through a small LRU so hot keys share
/// one allocation.
pub struct KeyCache {
    strings: Option<LruCache<String, Arc<str>>>,
    case_insensitive: bool,
}

impl KeyCache {
    pub fn new(capacity: usize, case_insensitive: bool) -> Self {
        KeyCache {
            strings: NonZeroUsize::new(capacity).map(LruCache::new),
            case_insensitive,
        }
    }

    pub fn intern(&mut self, s: &str) -> Arc<str> {
        let normalized;
        let s = if self.case_insensitive {
            normalized = s.to_lowercase();
            normalized.as_str()
        } else {
            s
        };

        let Some(strings) = &mut self.strings else {
            return Arc::from(s);
        };

        if let Some(cached) = strings.get(s) {
            return cached.clone();
        }
        let interned: Arc<str> = Arc::from(s);
        strings.put(s.to_string(), interned.clone());
        interned
    }

    pub fn len(&self) -> usize {
        self.strings.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn component(&mut self, value: &Value) -> KeyComponent {
        match value {
            Value::Null => KeyComponent::Null,
            Value::Bool(b) => KeyComponent::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(l) => KeyComponent::Long(l),
                None => KeyComponent::Double(OrderedFloat(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => KeyComponent::Text(self.intern(s)),
            other => KeyComponent::Text(self.intern(&other.to_string())),
        }
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        KeyCache::new(DEFAULT_KEY_CACHE_CAPACITY, false)
    }
}

/// Extracts the join keys of `hit`. A multi-valued field expands into one key
/// per value, so a hit registers under the cartesian product of its values.
pub fn extract_keys(hit: &SearchHit, key_fields: &[String], cache: &mut KeyCache) -> Vec<SequenceKey> {
    if key_fields.is_empty() {
        return vec![SequenceKey::NONE];
    }

    let per_field: Vec<Vec<KeyComponent>> = key_fields
        .iter()
        .map(|field| match hit.field(field) {
            None => vec![KeyComponent::Null],
            Some(Value::Array(values)) if values.is_empty() => vec![KeyComponent::Null],
            Some(Value::Array(values)) => values.iter().map(|v| cache.component(v)).collect(),
            Some(value) => vec![cache.component(value)],
        })
        .collect();

    cartesian_product(&per_field)
        .into_iter()
        .map(SequenceKey::new)
        .collect()
}

fn cartesian_product(per_field: &[Vec<KeyComponent>]) -> Vec<Vec<KeyComponent>> {
    let mut product: Vec<Vec<KeyComponent>> = vec![Vec::with_capacity(per_field.len())];
    for values in per_field {
        let mut next = Vec::with_capacity(product.len() * values.len());
        for prefix in &product {
            for value in values {
                let mut tuple = prefix.clone();
                tuple.push(value.clone());
                next.push(tuple);
            }
        }
        product = next;
    }
    product
}
