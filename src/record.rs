//! Record types the pipeline converges on.
//!
//! Every record is keyed by `task_id`, the join key between the metadata
//! table, both extraction tables, and the serving layer's question lookup.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One benchmark question / document unit.
///
/// Deserializes from the normalized metadata CSV, whose headers are the
/// benchmark's own keys (`Question`, `Level`, `Final answer`, ...), and
/// serializes with snake_case column names for the warehouse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub task_id: String,

    #[serde(default, rename(deserialize = "Question"), alias = "question")]
    pub question: String,

    #[serde(
        default,
        rename(deserialize = "Level"),
        alias = "level",
        deserialize_with = "csv::invalid_option"
    )]
    pub level: Option<i64>,

    #[serde(default, rename(deserialize = "Final answer"), alias = "final_answer")]
    pub final_answer: String,

    #[serde(default)]
    pub file_name: String,

    #[serde(
        default,
        rename(deserialize = "Annotator Metadata"),
        alias = "annotator_metadata"
    )]
    pub annotator_metadata: String,

    #[serde(default)]
    pub dataset_source: String,

    /// Resolved at load time from the staged files; `None` when the
    /// attachment is not in storage.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Open-source extraction output for one PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenSourceRecord {
    pub task_id: String,
    pub pdf_filename: String,
    pub extracted_text_length: Option<i64>,
    pub image_count: Option<i64>,
    /// Storage URIs of the extracted images, as JSON array text.
    pub image_paths: String,
    pub extracted_text: String,
}

/// Cloud extraction output for one PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudRecord {
    pub task_id: String,
    /// Folder the structured JSON was uploaded under.
    pub source: String,
    /// Storage URI of the structured JSON.
    pub file_path: String,
    /// Every text element, in document order, joined by single spaces.
    pub text: String,
}

/// A benchmark question backed by a PDF attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub task_id: String,
    pub question: String,
}

/// Which extractor produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    OpenSource,
    Cloud,
}

impl FromStr for ExtractionMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opensource" | "open-source" | "open_source" | "pymupdf" | "pdfium" => {
                Ok(ExtractionMethod::OpenSource)
            }
            "cloud" | "adobe" => Ok(ExtractionMethod::Cloud),
            other => Err(PipelineError::InvalidConfig(format!(
                "Unsupported extraction method: {other}"
            ))),
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::OpenSource => write!(f, "opensource"),
            ExtractionMethod::Cloud => write!(f, "cloud"),
        }
    }
}

/// Extracted data for one task, from either extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ExtractionResult {
    OpenSource(OpenSourceRecord),
    Cloud(CloudRecord),
}

impl ExtractionResult {
    pub fn task_id(&self) -> &str {
        match self {
            ExtractionResult::OpenSource(r) => &r.task_id,
            ExtractionResult::Cloud(r) => &r.task_id,
        }
    }

    /// The extracted document text.
    pub fn text(&self) -> &str {
        match self {
            ExtractionResult::OpenSource(r) => &r.extracted_text,
            ExtractionResult::Cloud(r) => &r.text,
        }
    }

    pub fn method(&self) -> ExtractionMethod {
        match self {
            ExtractionResult::OpenSource(_) => ExtractionMethod::OpenSource,
            ExtractionResult::Cloud(_) => ExtractionMethod::Cloud,
        }
    }
}
