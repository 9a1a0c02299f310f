use thiserror::Error;

#[derive(Debug, Error)]
pub enum CriterionError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("{context}: {message}")]
    Runtime {
        context: &'static str,
        message: String,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl CriterionError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn runtime(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Runtime {
            context,
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// True for failures raised while constructing the criterion.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Io { .. } | Self::Json { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_formats_context() {
        let err = CriterionError::runtime("matmul", "shape mismatch");
        assert_eq!(err.to_string(), "matmul: shape mismatch");
        assert!(!err.is_config());
    }

    #[test]
    fn io_errors_count_as_configuration_failures() {
        let err = CriterionError::io(
            "read dict.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.is_config());
        assert!(CriterionError::config("bad mode").is_config());
    }
}
