pub mod client;
pub mod config;
pub mod criterion;
pub mod errors;
pub mod matcher;
pub mod memory;
pub mod payload;
pub mod request;
pub mod sequence;
pub mod window;

pub use client::{QueryClient, SearchResponse};
pub use config::SequenceConfig;
pub use criterion::{SequenceCriterion, SequenceDefinition, StageDefinition};
pub use errors::SequenceError;
pub use matcher::{KeyAndOrdinal, MatcherStats, SequenceMatcher};
pub use memory::MemoryClient;
pub use payload::{Payload, SequenceResult};
pub use request::{BoxedQueryRequest, RangeBound, SearchRequest, SortOrder};
pub use sequence::{Match, Sequence};
pub use window::{TumblingWindow, WindowInfo};

/// Builds a window over `client` for a declarative definition.
pub fn window_for<C: QueryClient>(
    client: C,
    definition: &SequenceDefinition,
    config: &SequenceConfig,
) -> Result<TumblingWindow<C>, SequenceError> {
    let (criteria, until) = definition.criteria(config)?;
    TumblingWindow::new(client, criteria, until, config)
}
