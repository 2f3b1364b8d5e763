use crate::config::SequenceConfig;
use crate::errors::{invalid, SequenceError};
use crate::request::{BoxedQueryRequest, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tumbler_types::{extract_keys, KeyCache, Ordinal, OrdinalFields, SearchHit, SequenceKey, Timestamp};

/// One stage of a sequence: its boxed query plus how to position and key the
/// hits it returns.
#[derive(Debug, Clone)]
pub struct SequenceCriterion {
    stage: usize,
    request: BoxedQueryRequest,
    descending: bool,
    missing: bool,
}

impl SequenceCriterion {
    pub fn new(stage: usize, request: BoxedQueryRequest, missing: bool) -> Self {
        SequenceCriterion {
            stage,
            descending: request.order() == SortOrder::Desc,
            request,
            missing,
        }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn query_request(&self) -> &BoxedQueryRequest {
        &self.request
    }

    pub fn query_request_mut(&mut self) -> &mut BoxedQueryRequest {
        &mut self.request
    }

    pub fn descending(&self) -> bool {
        self.descending
    }

    pub fn missing(&self) -> bool {
        self.missing
    }

    pub fn key_size(&self) -> usize {
        self.request.key_fields().len()
    }

    pub fn ordinal(&self, hit: &SearchHit) -> Option<Ordinal> {
        self.request.fields().ordinal(hit)
    }

    pub fn timestamp(&self, hit: &SearchHit) -> Option<Timestamp> {
        self.request.fields().timestamp(hit)
    }

    pub fn keys(&self, hit: &SearchHit, cache: &mut KeyCache) -> Vec<SequenceKey> {
        extract_keys(hit, self.request.key_fields(), cache)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StageDefinition {
    #[serde(default)]
    pub filter: Value,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub missing: bool,
}

/// Declarative form of a sequence, as read by the command line driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SequenceDefinition {
    pub timestamp_field: String,
    #[serde(default)]
    pub tiebreaker_field: Option<String>,
    /// Return the last sequences, traversing the first stage newest first.
    #[serde(default)]
    pub tail: bool,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub until: Option<StageDefinition>,
}

impl SequenceDefinition {
    pub fn criteria(
        &self,
        config: &SequenceConfig,
    ) -> Result<(Vec<SequenceCriterion>, Option<SequenceCriterion>), SequenceError> {
        let fields = OrdinalFields::new(self.timestamp_field.clone(), self.tiebreaker_field.clone());
        let first_positive = self
            .stages
            .iter()
            .position(|s| !s.missing)
            .ok_or_else(|| invalid("a sequence needs at least one non-missing stage"))?;

        let request = |stage: &StageDefinition, order: SortOrder| {
            BoxedQueryRequest::new(
                stage.filter.clone(),
                fields.clone(),
                stage.keys.clone(),
                order,
                config.fetch_size,
            )
            .with_case_insensitive_keys(config.case_insensitive_keys)
        };

        let criteria = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let order = if self.tail && i == first_positive {
                    SortOrder::Desc
                } else {
                    SortOrder::Asc
                };
                SequenceCriterion::new(i, request(stage, order), stage.missing)
            })
            .collect();

        let until = self
            .until
            .as_ref()
            .map(|u| SequenceCriterion::new(self.stages.len(), request(u, SortOrder::Asc), false));

        Ok((criteria, until))
    }
}
