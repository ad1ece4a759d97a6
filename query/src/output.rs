//! Result-frame rendering for the response formats callers can request.

use common::arrow::csv;
use common::arrow::json;

use crate::engine::Frame;
use crate::error::QueryError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Frame,
    JsonRows,
    Csv,
}

#[derive(Debug)]
pub enum Output {
    Frame(Frame),
    /// A JSON array of row objects.
    Json(String),
    /// CSV text with a header row.
    Csv(String),
}

impl Output {
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Self::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

pub fn render(frame: Frame, format: OutputFormat) -> Result<Output, QueryError> {
    let serialization_error =
        |e: common::arrow::error::ArrowError| {
            QueryError::internal("failed to serialize the result frame")
                .with_original(e.to_string())
        };

    match format {
        OutputFormat::Frame => Ok(Output::Frame(frame)),
        OutputFormat::JsonRows => {
            let mut writer = json::ArrayWriter::new(Vec::new());
            for batch in &frame.batches {
                writer.write(batch).map_err(serialization_error)?;
            }
            writer.finish().map_err(serialization_error)?;
            // Unwrap: the arrow JSON writer emits valid UTF-8.
            Ok(Output::Json(String::from_utf8(writer.into_inner()).unwrap()))
        }
        OutputFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .with_header(true)
                .build(Vec::new());
            for batch in &frame.batches {
                writer.write(batch).map_err(serialization_error)?;
            }
            // Unwrap: the arrow CSV writer emits valid UTF-8.
            Ok(Output::Csv(String::from_utf8(writer.into_inner()).unwrap()))
        }
    }
}
