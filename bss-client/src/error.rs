use bss_core::TimestampError;
use thiserror::Error;

/// Why a single upstream document was dropped from its batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("document is not an object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not a numeric id: {value}")]
    BadId { field: &'static str, value: String },

    #[error("field `{field}`: {source}")]
    BadTimestamp {
        field: &'static str,
        #[source]
        source: TimestampError,
    },

    #[error("field `{field}` must be a list")]
    NotAList { field: &'static str },

    #[error("user entry {index} is not an object")]
    BadUser { index: usize },

    #[error("cannot serialize raw text: {0}")]
    Raw(String),
}
