use crate::request::SearchRequest;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tumbler_types::{HitReference, SearchHit};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    /// Hits in request sort order.
    pub hits: Vec<SearchHit>,
    pub timed_out: bool,
}

impl SearchResponse {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        SearchResponse {
            hits,
            timed_out: false,
        }
    }
}

/// The store the window reads from. Only one request is ever in flight;
/// implementations own any retry policy.
#[async_trait]
pub trait QueryClient: Send {
    async fn query(&mut self, request: SearchRequest) -> Result<SearchResponse>;

    /// Runs independent requests, returning responses in request order.
    async fn multi_query(&mut self, requests: Vec<SearchRequest>) -> Result<Vec<SearchResponse>>;

    /// Resolves references into documents, preserving the shape of `refs`.
    async fn fetch_hits(&mut self, refs: Vec<Vec<HitReference>>) -> Result<Vec<Vec<SearchHit>>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
