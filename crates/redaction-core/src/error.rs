use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RedactError {
    #[error("Failed to open document: {0}")]
    DocumentOpen(String),

    #[error("Malformed polygon: {0}")]
    MalformedPolygon(String),

    #[error("Redaction failed: {0}")]
    RedactionApply(String),

    #[error("Page {0} does not exist in the document")]
    PageNotFound(usize),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RedactError {
    /// Whether the error only affects a single fragment.
    ///
    /// Recoverable errors are recorded in the report and processing moves on
    /// to the next fragment; everything else aborts the document.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RedactError::MalformedPolygon(_)
                | RedactError::RedactionApply(_)
                | RedactError::PageNotFound(_)
        )
    }
}
