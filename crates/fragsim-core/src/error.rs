//! Store-level errors shared by the pair store, the frozen matrix and the query façade

use thiserror::Error;

use crate::bitset::CodecError;
use crate::format::FormatError;
use crate::similarity::SimilarityError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store: {0}")]
    Format(#[from] FormatError),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Label not found: {0}")]
    LabelNotFound(String),

    #[error("Id not found: {0}")]
    IdNotFound(u32),

    #[error("Label {label} already mapped to id {existing}")]
    DuplicateLabel { label: String, existing: u32 },

    #[error("Id {id} already mapped to label {existing}")]
    DuplicateId { id: u32, existing: String },

    #[error("Label is {len} bytes, longer than the 65535 a store can hold")]
    LabelTooLong { len: usize },

    #[error("No free id left for label {0}")]
    IdsExhausted(String),

    #[error("Invalid format request: {0}")]
    InvalidFormatRequest(String),

    #[error("Incompatible precision: {left} vs {right}")]
    IncompatiblePrecision { left: u16, right: u16 },

    #[error("Label map mismatch: {0}")]
    LabelMismatch(String),

    #[error("Store opened read-only")]
    ReadOnly,

    #[error("Similarity error: {0}")]
    Similarity(#[from] SimilarityError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl StoreError {
    /// Missing label or id, as opposed to an empty hit list
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::LabelNotFound(_) | StoreError::IdNotFound(_))
    }

    /// Expected sections absent or malformed
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Format(_) | StoreError::Corrupt(_))
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        StoreError::Corrupt(message.into())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
