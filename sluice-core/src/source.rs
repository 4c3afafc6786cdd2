//! The shapes a fetched dataset can take
//!
//! Source fetchers hand back a [`SourceHandle`]. Every shape is an explicit variant so that the
//! extraction step handles each of them exhaustively.
use std::{collections::BTreeMap, fmt};

use serde_json::Value;

use crate::metadata::Metadata;

/// Parameters passed to a source fetcher, filtered to the keys it accepts
pub type DatasetParams = BTreeMap<String, Value>;

/// Fallible iterator over records whose length is not known upfront
pub struct RecordIter(Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>);

impl RecordIter {
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<Value>>,
        I::IntoIter: Send + 'static,
    {
        Self(Box::new(iter.into_iter()))
    }
}

impl Iterator for RecordIter {
    type Item = anyhow::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl fmt::Debug for RecordIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordIter").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum SourceHandle {
    /// An ordered sequence of records
    SequenceOfRecords(Vec<Value>),
    /// A keyed collection holding a list of questions, plus labels that apply to all of them
    KeyedQuestionList { questions: Vec<Value>, labels: Metadata },
    /// A single payload, imported as one item
    ScalarPayload(Value),
    /// Records produced lazily by the fetcher; the length is unknown
    LazyRecords(RecordIter),
    /// Anything else, imported as its JSON text
    Unknown(Value),
}

impl SourceHandle {
    /// Classifies a raw JSON document.
    ///
    /// Arrays are sequences, objects with a `questions` array are keyed lists whose remaining
    /// keys become labels, strings, numbers and booleans are scalars.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(records) => SourceHandle::SequenceOfRecords(records),
            Value::Object(mut map) => match map.remove("questions") {
                Some(Value::Array(questions)) => SourceHandle::KeyedQuestionList {
                    questions,
                    labels: map.into(),
                },
                Some(other) => {
                    map.insert("questions".to_string(), other);
                    SourceHandle::Unknown(Value::Object(map))
                }
                None => SourceHandle::Unknown(Value::Object(map)),
            },
            scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => {
                SourceHandle::ScalarPayload(scalar)
            }
            other => SourceHandle::Unknown(other),
        }
    }

    /// Number of items the handle will produce, if known without consuming it
    pub fn len(&self) -> Option<usize> {
        match self {
            SourceHandle::SequenceOfRecords(records) => Some(records.len()),
            SourceHandle::KeyedQuestionList { questions, .. } => Some(questions.len()),
            SourceHandle::ScalarPayload(_) | SourceHandle::Unknown(_) => Some(1),
            SourceHandle::LazyRecords(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Average serialized size in bytes of up to `sample` leading items.
    ///
    /// `None` when the length is unknown or there is nothing to sample.
    pub fn average_item_size(&self, sample: usize) -> Option<usize> {
        let records: &[Value] = match self {
            SourceHandle::SequenceOfRecords(records) => records,
            SourceHandle::KeyedQuestionList { questions, .. } => questions,
            SourceHandle::ScalarPayload(value) | SourceHandle::Unknown(value) => {
                std::slice::from_ref(value)
            }
            SourceHandle::LazyRecords(_) => return None,
        };

        let sampled = &records[..records.len().min(sample)];
        if sampled.is_empty() {
            return None;
        }

        let total: usize = sampled.iter().map(serialized_size).sum();
        Some(total / sampled.len())
    }

    /// Stable tag of the variant, used in logs
    pub fn shape(&self) -> &'static str {
        match self {
            SourceHandle::SequenceOfRecords(_) => "sequence",
            SourceHandle::KeyedQuestionList { .. } => "keyed",
            SourceHandle::ScalarPayload(_) => "scalar",
            SourceHandle::LazyRecords(_) => "lazy",
            SourceHandle::Unknown(_) => "unknown",
        }
    }
}

impl From<Value> for SourceHandle {
    fn from(value: Value) -> Self {
        SourceHandle::from_json(value)
    }
}

fn serialized_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map_or(0, |bytes| bytes.len()),
    }
}

/// Keeps only the parameters a fetcher declares it accepts. `None` accepts everything.
pub fn filter_params(params: &DatasetParams, accepted: Option<&[String]>) -> DatasetParams {
    match accepted {
        None => params.clone(),
        Some(accepted) => params
            .iter()
            .filter(|(key, _)| accepted.iter().any(|a| a == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}
