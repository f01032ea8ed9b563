use thiserror::Error;

/// Errors from repository operations (used by trait definitions in termops-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_conflict_display() {
        let err = RepositoryError::Conflict("ambiguous run id prefix '01'".to_string());
        assert!(err.to_string().contains("ambiguous"));
    }
}
