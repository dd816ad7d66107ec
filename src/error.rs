use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes as `{ error, kind }` so the sidecar and API layer can forward it verbatim.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("AI provider error: {0}")]
    Ai(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recovery exhausted for {domain} after {attempts} attempts (incident {incident_id})")]
    RecoveryExhausted {
        domain: String,
        attempts: usize,
        incident_id: String,
    },

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Infrastructure failures (store, AI, database, deadlines) as opposed to
    /// problems with the request itself. Callers fail open on these.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Pool(_)
                | AppError::Io(_)
                | AppError::Store(_)
                | AppError::Ai(_)
                | AppError::Timeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Store(_) => "store",
            AppError::Ai(_) => "ai",
            AppError::Timeout(_) => "timeout",
            AppError::Config(_) => "config",
            AppError::RecoveryExhausted { .. } => "recovery_exhausted",
            AppError::Internal(_) => "internal",
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_kind_and_message() {
        let err = AppError::Store("connection refused".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "store");
        assert_eq!(json["error"], "Coordination store error: connection refused");
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(AppError::Store("x".into()).is_infrastructure());
        assert!(AppError::Ai("x".into()).is_infrastructure());
        assert!(AppError::Timeout("x".into()).is_infrastructure());
        assert!(!AppError::Validation("x".into()).is_infrastructure());
        assert!(!AppError::NotFound("x".into()).is_infrastructure());
    }
}
