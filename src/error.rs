//! Error types for the local Docker runner.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the runner and its collaborators.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// No successful healthcheck has populated the shared runner state.
    #[error("runner not initialised; run a healthcheck with fix enabled first")]
    Uninitialised,

    /// The container engine cannot be reached at all.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// An object with the requested name exists with incompatible
    /// configuration.
    #[error("{object} exists with conflicting configuration: {detail}")]
    Conflict { object: String, detail: String },

    /// The requested image is absent locally and pulling was not allowed.
    #[error("image not found: {image}")]
    ImageNotFound { image: String },

    /// The deterministic data-network table has no free subnet left.
    #[error("data network address space exhausted")]
    AddressSpaceExhausted,

    /// The run input failed validation.
    #[error("invalid run input: {0}")]
    InvalidInput(String),

    /// Teardown accumulated one or more errors.
    #[error("teardown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    PartialFailure(Vec<String>),

    /// The enclosing context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An engine call failed; annotated with the operation and object.
    #[error("docker {op} failed for {object}: {message}")]
    Engine {
        op: &'static str,
        object: String,
        message: String,
    },

    /// A filesystem operation failed.
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// Wrap an engine error with the operation and object it concerned.
    pub fn engine(op: &'static str, object: impl Into<String>, err: bollard::errors::Error) -> Self {
        RunnerError::Engine {
            op,
            object: object.into(),
            message: err.to_string(),
        }
    }

    /// Wrap a filesystem error with the path it concerned.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classify an engine error as "image not found".
///
/// The engine reports a missing image as a 404 on container create or image
/// inspect. Classification happens on the response, never by comparing error
/// values by identity.
pub fn is_image_not_found(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => {
            let message = message.to_ascii_lowercase();
            message.contains("no such image") || message.contains("not found")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_lists_every_error() {
        let err = RunnerError::PartialFailure(vec![
            "remove container a: boom".to_string(),
            "remove network n: gone".to_string(),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("2 error(s)"));
        assert!(rendered.contains("remove container a: boom"));
        assert!(rendered.contains("remove network n: gone"));
    }

    #[test]
    fn classifies_missing_image_from_404() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image: ipfs/testground:latest".to_string(),
        };
        assert!(is_image_not_found(&err));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "No such image: whatever".to_string(),
        };
        assert!(!is_image_not_found(&err));
    }

    #[test]
    fn engine_error_names_operation_and_object() {
        let source = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };
        let err = RunnerError::engine("network create", "tg-plan-case-run-default", source);
        let rendered = err.to_string();
        assert!(rendered.contains("network create"));
        assert!(rendered.contains("tg-plan-case-run-default"));
    }
}
