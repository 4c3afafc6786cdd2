//! Turns raw records into `(text, metadata)` pairs
//!
//! Dispatch happens on the shape of the [`SourceHandle`]:
//!
//! - sequences tag every item with its `index` and `format = "sequence"`; a record's own
//!   `index` field is kept as `source_index`
//! - keyed question lists pass the dataset labels through and tag `format = "keyed"`
//! - a scalar payload becomes a single item tagged `format = "scalar"`
//! - anything else is imported as its JSON text, tagged `format = "unknown"`
use anyhow::{Result, bail};
use serde_json::Value;
use sluice_core::{Metadata, SourceHandle};

/// Keys holding the text of a record, in order of preference
pub const TEXT_FIELDS: &[&str] = &["text", "question", "prompt", "content", "input"];

pub const FORMAT_KEY: &str = "format";
/// Position of the item in the source, always set by the pipeline
pub const INDEX_KEY: &str = "index";
/// Where a record's own `index` field ends up
pub const SOURCE_INDEX_KEY: &str = "source_index";

/// Format tag of a record, as written into its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RecordFormat {
    Sequence,
    Keyed,
    Scalar,
    Unknown,
}

/// Source of records that remembers their shape
pub(crate) enum Records {
    Eager {
        records: std::vec::IntoIter<Value>,
        format: RecordFormat,
        labels: Metadata,
    },
    Lazy(sluice_core::RecordIter),
}

impl Records {
    pub(crate) fn from_handle(handle: SourceHandle) -> Self {
        match handle {
            SourceHandle::SequenceOfRecords(records) => Records::Eager {
                records: records.into_iter(),
                format: RecordFormat::Sequence,
                labels: Metadata::default(),
            },
            SourceHandle::KeyedQuestionList { questions, labels } => Records::Eager {
                records: questions.into_iter(),
                format: RecordFormat::Keyed,
                labels,
            },
            SourceHandle::ScalarPayload(value) => Records::Eager {
                records: vec![value].into_iter(),
                format: RecordFormat::Scalar,
                labels: Metadata::default(),
            },
            SourceHandle::Unknown(value) => Records::Eager {
                records: vec![value].into_iter(),
                format: RecordFormat::Unknown,
                labels: Metadata::default(),
            },
            SourceHandle::LazyRecords(iter) => Records::Lazy(iter),
        }
    }

    /// Extracts the next item, `index` being its position in the whole source
    pub(crate) fn next_item(&mut self, index: usize) -> Option<Result<(String, Metadata)>> {
        match self {
            Records::Eager {
                records,
                format,
                labels,
            } => {
                let record = records.next()?;
                Some(extract_item(record, *format, labels, index))
            }
            Records::Lazy(iter) => {
                let record = iter.next()?;
                Some(record.and_then(|record| {
                    extract_item(record, RecordFormat::Sequence, &Metadata::default(), index)
                }))
            }
        }
    }
}

/// Extracts the text and metadata of a single record
///
/// # Errors
///
/// Errors when the record is `null`.
pub fn extract_item(
    record: Value,
    format: RecordFormat,
    labels: &Metadata,
    index: usize,
) -> Result<(String, Metadata)> {
    let mut metadata = labels.clone();

    let (text, format) = match (record, format) {
        (Value::Null, _) => bail!("record {index} is null"),
        (record, RecordFormat::Unknown) => (stringify_unknown(&record), RecordFormat::Unknown),
        (Value::Object(mut map), format) => {
            match TEXT_FIELDS.iter().find_map(|key| map.remove(*key)) {
                Some(text) => {
                    metadata.extend(map);
                    (text_of(text), format)
                }
                None => (
                    stringify_unknown(&Value::Object(map)),
                    RecordFormat::Unknown,
                ),
            }
        }
        (record, format) => (text_of(record), format),
    };

    if format != RecordFormat::Scalar {
        if let Some(label) = metadata.remove(INDEX_KEY) {
            metadata.insert_if_absent(SOURCE_INDEX_KEY, label);
        }
        metadata.insert(INDEX_KEY, index);
    }
    metadata.insert_if_absent(FORMAT_KEY, format.as_ref());

    Ok((text, metadata))
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Array(values) => values
            .into_iter()
            .map(text_of)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn stringify_unknown(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
