use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tumbler_types::{Ordinal, OrdinalFields, SequenceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeBound {
    pub ordinal: Ordinal,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(ordinal: Ordinal) -> Self {
        RangeBound {
            ordinal,
            inclusive: true,
        }
    }

    pub fn exclusive(ordinal: Ordinal) -> Self {
        RangeBound {
            ordinal,
            inclusive: false,
        }
    }

    pub fn admits_above(&self, ordinal: &Ordinal) -> bool {
        if self.inclusive {
            ordinal >= &self.ordinal
        } else {
            ordinal > &self.ordinal
        }
    }

    pub fn admits_below(&self, ordinal: &Ordinal) -> bool {
        if self.inclusive {
            ordinal <= &self.ordinal
        } else {
            ordinal < &self.ordinal
        }
    }
}

/// One bounded, sorted, filtered and size limited query, as handed to a
/// [`crate::client::QueryClient`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    /// Stage filter, opaque to the window.
    pub filter: Value,
    pub fields: OrdinalFields,
    pub key_fields: Vec<String>,
    /// Disjunction of key tuples over `key_fields`; empty means unconstrained.
    pub keys: Vec<SequenceKey>,
    pub case_insensitive_keys: bool,
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
    /// Resume cursor: only hits strictly past it in sort order qualify.
    pub search_after: Option<Ordinal>,
    pub order: SortOrder,
    pub size: usize,
    /// Remaining time budget of the execution.
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    pub fn admits(&self, ordinal: &Ordinal) -> bool {
        if let Some(lower) = &self.lower {
            if !lower.admits_above(ordinal) {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if !upper.admits_below(ordinal) {
                return false;
            }
        }
        match (&self.search_after, self.order) {
            (Some(after), SortOrder::Asc) => ordinal > after,
            (Some(after), SortOrder::Desc) => ordinal < after,
            (None, _) => true,
        }
    }
}

/// A stage query boxed into a `[from, to]` ordinal range with a resumable
/// cursor. The window moves the box; the stage filter never changes.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxedQueryRequest {
    filter: Value,
    fields: OrdinalFields,
    key_fields: Vec<String>,
    case_insensitive_keys: bool,
    order: SortOrder,
    size: usize,
    from: Option<Ordinal>,
    to: Option<Ordinal>,
    after: Option<Ordinal>,
    keys: Vec<SequenceKey>,
}

impl BoxedQueryRequest {
    pub fn new(
        filter: Value,
        fields: OrdinalFields,
        key_fields: Vec<String>,
        order: SortOrder,
        size: usize,
    ) -> Self {
        BoxedQueryRequest {
            filter,
            fields,
            key_fields,
            case_insensitive_keys: false,
            order,
            size,
            from: None,
            to: None,
            after: None,
            keys: vec![],
        }
    }

    pub fn with_case_insensitive_keys(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive_keys = case_insensitive;
        self
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    pub fn fields(&self) -> &OrdinalFields {
        &self.fields
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn from(&self) -> Option<&Ordinal> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Ordinal> {
        self.to.as_ref()
    }

    pub fn after(&self) -> Option<&Ordinal> {
        self.after.as_ref()
    }

    pub fn keys(&self) -> &[SequenceKey] {
        &self.keys
    }

    pub fn set_from(&mut self, from: Option<Ordinal>) {
        self.from = from;
    }

    pub fn set_to(&mut self, to: Option<Ordinal>) {
        self.to = to;
    }

    pub fn set_keys(&mut self, keys: Vec<SequenceKey>) {
        self.keys = keys;
    }

    /// Moves the resume cursor so the next page starts past `ordinal`.
    pub fn next_after(&mut self, ordinal: Ordinal) {
        self.after = Some(ordinal);
    }

    pub fn reset_after(&mut self) {
        self.after = None;
    }

    pub fn to_search_request(&self, timeout: Option<Duration>) -> SearchRequest {
        SearchRequest {
            filter: self.filter.clone(),
            fields: self.fields.clone(),
            key_fields: self.key_fields.clone(),
            keys: self.keys.clone(),
            case_insensitive_keys: self.case_insensitive_keys,
            lower: self.from.clone().map(RangeBound::inclusive),
            upper: self.to.clone().map(RangeBound::inclusive),
            search_after: self.after.clone(),
            order: self.order,
            size: self.size,
            timeout,
        }
    }

    /// A single-hit probe sharing this stage's filter and key fields, bounded
    /// strictly between `lower` and `upper`.
    pub fn probe(
        &self,
        lower: Option<Ordinal>,
        upper: Option<Ordinal>,
        order: SortOrder,
        key: Option<SequenceKey>,
        timeout: Option<Duration>,
    ) -> SearchRequest {
        SearchRequest {
            filter: self.filter.clone(),
            fields: self.fields.clone(),
            key_fields: self.key_fields.clone(),
            keys: key.into_iter().collect(),
            case_insensitive_keys: self.case_insensitive_keys,
            lower: lower.map(RangeBound::exclusive),
            upper: upper.map(RangeBound::exclusive),
            search_after: None,
            order,
            size: 1,
            timeout,
        }
    }
}

impl Display for BoxedQueryRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let show = |o: &Option<Ordinal>| o.as_ref().map(|o| o.to_string()).unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} [{} -> {}] after {} ({} keys, size {}, {:?})",
            self.filter,
            show(&self.from),
            show(&self.to),
            show(&self.after),
            self.keys.len(),
            self.size,
            self.order
        )
    }
}
