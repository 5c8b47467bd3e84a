use anyhow::Error as AnyError;
use thiserror::Error;

/// An error produced by the grammar layer. The engine never creates these,
/// it only carries them through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at line {line}, col {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The query is well-formed but does not type check or uses an operator
    /// where it is not allowed.
    #[error("invalid query: {0}")]
    Validation(String),

    /// The query is valid but asks for something that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Evaluation failed part way through.
    #[error("{0}")]
    Execution(String),

    /// The request parameters (time range, step, query kind) are invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0:#}")]
    Storage(AnyError),
}

impl EngineError {
    /// Only failures of the storage collaborator are worth retrying; every
    /// other error is a property of the query itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }
}

impl From<AnyError> for EngineError {
    fn from(err: AnyError) -> EngineError {
        // engine errors raised from a second-pass callback come back wrapped
        match err.downcast::<EngineError>() {
            Ok(err) => err,
            Err(err) => EngineError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn parse_errors_pass_through() {
        let parse = ParseError {
            line: 1,
            column: 7,
            message: "unexpected }".to_owned(),
        };

        let err = EngineError::from(parse.clone());
        assert_eq!(err.to_string(), "parse error at line 1, col 7: unexpected }");
        assert!(matches!(err, EngineError::Parse(p) if p == parse));
    }

    #[test]
    fn engine_errors_survive_a_round_trip_through_storage() {
        let wrapped = AnyError::from(EngineError::Execution("boom".to_owned()));
        let err = EngineError::from(wrapped);
        assert!(matches!(err, EngineError::Execution(msg) if msg == "boom"));

        let err = EngineError::from(anyhow!("disk on fire"));
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.is_retryable());
    }
}
