use crate::client::{QueryClient, SearchResponse};
use crate::request::{SearchRequest, SortOrder};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use tumbler_types::{extract_keys, HitReference, KeyCache, Ordinal, SearchHit};

/// A [`QueryClient`] over documents held in memory. Every served request is
/// recorded, which the tests use to check how queries were boxed.
#[derive(Debug, Default)]
pub struct MemoryClient {
    docs: Vec<SearchHit>,
    by_ref: HashMap<HitReference, usize>,
    requests: Vec<SearchRequest>,
    multi_requests: Vec<Vec<SearchRequest>>,
    closed: bool,
}

impl MemoryClient {
    pub fn new(docs: Vec<SearchHit>) -> Self {
        let by_ref = docs
            .iter()
            .enumerate()
            .map(|(i, doc)| (doc.reference(), i))
            .collect();
        MemoryClient {
            docs,
            by_ref,
            ..Default::default()
        }
    }

    /// Builds documents from JSON sources; ids are their positions.
    pub fn from_sources(index: &str, sources: Vec<Value>) -> Self {
        Self::new(
            sources
                .into_iter()
                .enumerate()
                .map(|(i, source)| {
                    let id = source
                        .get("_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| i.to_string());
                    SearchHit::new(index, id, i as u64, source)
                })
                .collect(),
        )
    }

    pub fn requests(&self) -> &[SearchRequest] {
        &self.requests
    }

    pub fn multi_requests(&self) -> &[Vec<SearchRequest>] {
        &self.multi_requests
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn search(&self, request: &SearchRequest) -> SearchResponse {
        let mut cache = KeyCache::new(0, request.case_insensitive_keys);
        let mut matches: Vec<(Ordinal, &SearchHit)> = self
            .docs
            .iter()
            .filter(|doc| matches_filter(doc, &request.filter))
            .filter_map(|doc| Some((request.fields.ordinal(doc)?, doc)))
            .filter(|(ordinal, _)| request.admits(ordinal))
            .filter(|(_, doc)| {
                request.keys.is_empty()
                    || extract_keys(doc, &request.key_fields, &mut cache)
                        .iter()
                        .any(|k| request.keys.contains(k))
            })
            .collect();

        matches.sort_by(|(a, _), (b, _)| a.cmp(b));
        if request.order == SortOrder::Desc {
            matches.reverse();
        }

        SearchResponse::new(
            matches
                .into_iter()
                .take(request.size)
                .map(|(_, doc)| doc.clone())
                .collect(),
        )
    }
}

/// An object filter holds `field -> expected` equalities; an array expected
/// value matches any of its elements, an array field matches if any element
/// does. `null` and `{}` match everything.
pub fn matches_filter(doc: &SearchHit, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return filter.is_null();
    };

    conditions.iter().all(|(field, expected)| {
        let Some(actual) = doc.field(field) else {
            return expected.is_null();
        };
        let candidates: Vec<&Value> = match actual {
            Value::Array(values) => values.iter().collect(),
            v => vec![v],
        };
        match expected {
            Value::Array(options) => options.iter().any(|o| candidates.contains(&o)),
            e => candidates.contains(&e),
        }
    })
}

#[async_trait]
impl QueryClient for MemoryClient {
    async fn query(&mut self, request: SearchRequest) -> Result<SearchResponse> {
        let response = self.search(&request);
        debug!(
            message = "memory query",
            filter = %request.filter,
            order = ?request.order,
            hits = response.hits.len()
        );
        self.requests.push(request);
        Ok(response)
    }

    async fn multi_query(&mut self, requests: Vec<SearchRequest>) -> Result<Vec<SearchResponse>> {
        let responses = requests.iter().map(|r| self.search(r)).collect();
        self.multi_requests.push(requests);
        Ok(responses)
    }

    async fn fetch_hits(&mut self, refs: Vec<Vec<HitReference>>) -> Result<Vec<Vec<SearchHit>>> {
        refs.into_iter()
            .map(|sequence| {
                sequence
                    .into_iter()
                    .map(|r| {
                        self.by_ref
                            .get(&r)
                            .map(|i| self.docs[*i].clone())
                            .ok_or_else(|| anyhow!("no document {}/{}", r.index, r.id))
                    })
                    .collect()
            })
            .collect()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::BoxedQueryRequest;
    use serde_json::json;
    use tumbler_types::{KeyComponent, OrdinalFields, SequenceKey};

    fn client() -> MemoryClient {
        MemoryClient::from_sources(
            "logs",
            vec![
                json!({"@timestamp": 10, "event": "a", "host": "h1"}),
                json!({"@timestamp": 20, "event": "b", "host": ["h1", "h2"]}),
                json!({"@timestamp": 30, "event": "a", "host": "h2"}),
                json!({"@timestamp": 40, "event": "a", "host": "h1"}),
            ],
        )
    }

    fn request(filter: Value, order: SortOrder) -> BoxedQueryRequest {
        BoxedQueryRequest::new(
            filter,
            OrdinalFields::new("@timestamp", None),
            vec!["host".to_string()],
            order,
            2,
        )
    }

    fn timestamps(response: &SearchResponse) -> Vec<i64> {
        response
            .hits
            .iter()
            .map(|h| h.field("@timestamp").and_then(Value::as_i64).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_sorted_sized_queries() {
        let mut client = client();
        let asc = request(json!({"event": "a"}), SortOrder::Asc);
        let response = client.query(asc.to_search_request(None)).await.unwrap();
        assert_eq!(timestamps(&response), vec![10, 30]);

        let desc = request(json!({"event": "a"}), SortOrder::Desc);
        let response = client.query(desc.to_search_request(None)).await.unwrap();
        assert_eq!(timestamps(&response), vec![40, 30]);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_key_filter_matches_any_value() {
        let mut client = client();
        let mut r = request(json!({"event": ["a", "b"]}), SortOrder::Asc);
        r.set_keys(vec![SequenceKey::new(vec![KeyComponent::Text("h2".into())])]);
        let response = client.query(r.to_search_request(None)).await.unwrap();
        assert_eq!(timestamps(&response), vec![20, 30]);
    }

    #[tokio::test]
    async fn test_fetch_hits_preserves_shape() {
        let mut client = client();
        let fetched = client
            .fetch_hits(vec![
                vec![HitReference::new("logs", "1"), HitReference::new("logs", "0")],
                vec![HitReference::new("logs", "3")],
            ])
            .await
            .unwrap();
        assert_eq!(fetched[0][0].id, "1");
        assert_eq!(fetched[0][1].id, "0");
        assert_eq!(fetched[1][0].id, "3");

        assert!(client
            .fetch_hits(vec![vec![HitReference::new("logs", "9")]])
            .await
            .is_err());
    }
}
