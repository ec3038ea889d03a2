use thiserror::Error;

/// Errors surfaced to the statement that tripped a runaway rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunawayError {
    #[error("Quarantined and interrupted because of being in runaway watch list")]
    Quarantined,
    #[error("Query execution was interrupted, identified as runaway query [{0}]")]
    QueryInterrupted(String),
}
