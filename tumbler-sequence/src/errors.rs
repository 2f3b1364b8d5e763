use thiserror::Error;

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("query for stage {stage} failed: {source:?}")]
    Query {
        stage: usize,
        source: anyhow::Error,
    },

    #[error("query for until condition failed: {0:?}")]
    Until(anyhow::Error),

    #[error("missing event check failed: {0:?}")]
    MultiQuery(anyhow::Error),

    #[error("fetching sequence hits failed: {0:?}")]
    FetchHits(anyhow::Error),

    #[error("invalid sequence definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration: {0}")]
    Config(#[from] figment::Error),
}

pub fn invalid(message: impl Into<String>) -> SequenceError {
    SequenceError::InvalidDefinition(message.into())
}
