//! Generation Lineage
//!
//! Every value produced by a model carries a [`GenerationLineage`] pointing at
//! the input it was derived from. The input may carry its own lineage, so the
//! records form a strictly linear backward chain that ends at an original
//! source (a value with no lineage).
//!
//! Fan-in (outputs derived from several inputs) would turn the chain into a
//! DAG; the record holds a single `input` and multi-input models are expected
//! to pick a primary input.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::media::{MediaSummary, MediaValue};
use crate::core::{CoreResult, ModelId, Options, ProviderId};

// =============================================================================
// GenerationLineage
// =============================================================================

/// One model invocation recorded on its output
#[derive(Debug, Clone)]
pub struct GenerationLineage {
    step: usize,
    provider: ProviderId,
    model: ModelId,
    options: Options,
    timestamp: DateTime<Utc>,
    input: Arc<MediaValue>,
}

impl GenerationLineage {
    /// Records an invocation. The step index is the input's own chain length,
    /// so the first transformation of an original source is step 0.
    pub(crate) fn new(
        provider: impl Into<ProviderId>,
        model: impl Into<ModelId>,
        options: Options,
        input: MediaValue,
    ) -> Self {
        Self {
            step: input.lineage_depth(),
            provider: provider.into(),
            model: model.into(),
            options,
            timestamp: Utc::now(),
            input: Arc::new(input),
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fully resolved options the model was invoked with
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn input(&self) -> &MediaValue {
        &self.input
    }

    pub fn to_record(&self) -> LineageRecord {
        LineageRecord {
            step: self.step,
            provider: self.provider.clone(),
            model: self.model.clone(),
            options: self.options.clone(),
            timestamp: self.timestamp,
            input: self.input.summary(),
        }
    }
}

// =============================================================================
// LineageChain
// =============================================================================

/// Walks a value's lineage from the most recent step back to the root.
#[derive(Debug, Clone)]
pub struct LineageChain<'a> {
    start: &'a MediaValue,
    current: Option<&'a MediaValue>,
}

impl<'a> LineageChain<'a> {
    pub fn new(value: &'a MediaValue) -> Self {
        Self {
            start: value,
            current: Some(value),
        }
    }

    /// Number of recorded steps
    pub fn depth(&self) -> usize {
        LineageChain::new(self.start).count()
    }

    /// The original source at the end of the chain
    pub fn root(&self) -> &'a MediaValue {
        let mut value = self.start;
        while let Some(lineage) = value.lineage() {
            value = lineage.input();
        }
        value
    }

    /// Serializable records, root first
    pub fn records(&self) -> Vec<LineageRecord> {
        let mut records: Vec<LineageRecord> =
            LineageChain::new(self.start).map(GenerationLineage::to_record).collect();
        records.reverse();
        records
    }

    pub fn report(&self) -> ProvenanceReport {
        ProvenanceReport {
            asset: self.start.summary(),
            root: self.root().summary(),
            depth: self.depth(),
            steps: self.records(),
        }
    }
}

impl<'a> Iterator for LineageChain<'a> {
    type Item = &'a GenerationLineage;

    fn next(&mut self) -> Option<Self::Item> {
        let lineage = self.current?.lineage();
        self.current = lineage.map(|l| l.input());
        lineage
    }
}

// =============================================================================
// Serializable Records
// =============================================================================

/// Flattened lineage step for reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageRecord {
    pub step: usize,
    pub provider: ProviderId,
    pub model: ModelId,
    pub options: Options,
    pub timestamp: DateTime<Utc>,
    pub input: MediaSummary,
}

/// Provenance of one asset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceReport {
    pub asset: MediaSummary,
    pub root: MediaSummary,
    pub depth: usize,
    pub steps: Vec<LineageRecord>,
}

impl ProvenanceReport {
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::Text;
    use crate::core::options_from;
    use serde_json::json;

    fn derive(input: MediaValue, model: &str, content: &str) -> MediaValue {
        let lineage = GenerationLineage::new("mock", model, options_from(json!({"n": 1})), input);
        MediaValue::from(Text::new(content)).with_lineage(lineage)
    }

    #[test]
    fn test_source_has_empty_chain() {
        let source = MediaValue::from(Text::new("root"));
        let chain = source.history();

        assert_eq!(chain.depth(), 0);
        assert_eq!(chain.root().id(), source.id());
        assert!(chain.records().is_empty());
    }

    #[test]
    fn test_chain_walks_back_to_root() {
        let source = MediaValue::from(Text::new("root"));
        let root_id = source.id().to_string();
        let a = derive(source, "first", "a");
        let b = derive(a, "second", "b");
        let c = derive(b, "third", "c");

        let steps: Vec<(usize, &str)> = c.history().map(|l| (l.step(), l.model())).collect();
        assert_eq!(steps, vec![(2, "third"), (1, "second"), (0, "first")]);
        assert_eq!(c.lineage_depth(), 3);
        assert_eq!(c.history().root().id(), root_id);
    }

    #[test]
    fn test_records_are_root_first() {
        let source = MediaValue::from(Text::new("root"));
        let b = derive(derive(source, "first", "a"), "second", "b");

        let records = b.history().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].model, "first");
        assert_eq!(records[0].input.preview.as_deref(), Some("root"));
        assert_eq!(records[1].step, 1);
    }

    #[test]
    fn test_report_serializes() {
        let source = MediaValue::from(Text::new("root"));
        let a = derive(source, "first", "a");

        let json = a.history().report().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["depth"], 1);
        assert_eq!(parsed["steps"][0]["provider"], "mock");
        assert_eq!(parsed["steps"][0]["options"]["n"], 1);
    }
}
