use thiserror::Error;

/// Error taxonomy shared by tensors, the convolution backend and the layers built on it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Invalid configuration in operation '{operation}': {reason}")]
    InvalidConfiguration { operation: String, reason: String },

    #[error("Shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    #[error("Invalid shape in operation '{operation}': {reason}")]
    InvalidShape {
        operation: String,
        reason: String,
        shape: Option<Vec<usize>>,
    },

    #[error("Invalid argument in operation '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("Memory allocation failed in operation '{operation}': {details}")]
    AllocationError {
        operation: String,
        details: String,
        requested_bytes: Option<usize>,
        available_bytes: Option<usize>,
    },

    #[error("No viable algorithm for '{operation}' within {workspace_limit} bytes of workspace")]
    AlgorithmUnavailable {
        operation: String,
        workspace_limit: usize,
    },

    #[error("Operation '{operation}' is not valid in lifecycle state {state}")]
    InvalidLifecycle { operation: String, state: String },

    #[error("Backend error in operation '{operation}': {details}")]
    BackendError { operation: String, details: String },

    #[error("Serialization error in operation '{operation}': {details}")]
    SerializationError { operation: String, details: String },

    #[error("IO error in operation '{operation}': {details}")]
    IoError {
        operation: String,
        details: String,
        path: Option<String>,
    },
}

impl TensorError {
    /// Create a configuration error with operation context
    pub fn invalid_configuration(operation: &str, reason: &str) -> Self {
        Self::InvalidConfiguration {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a shape mismatch error with context
    pub fn shape_mismatch(operation: &str, expected: &str, got: &str) -> Self {
        Self::ShapeMismatch {
            operation: operation.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// Create an invalid shape error carrying the offending shape
    pub fn invalid_shape(operation: &str, reason: &str, shape: &[usize]) -> Self {
        Self::InvalidShape {
            operation: operation.to_string(),
            reason: reason.to_string(),
            shape: Some(shape.to_vec()),
        }
    }

    /// Create an invalid shape error without operation context
    pub fn invalid_shape_simple(reason: String) -> Self {
        Self::InvalidShape {
            operation: "unknown".to_string(),
            reason,
            shape: None,
        }
    }

    /// Create an invalid argument error with operation context
    pub fn invalid_argument_op(operation: &str, reason: &str) -> Self {
        Self::InvalidArgument {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an allocation error with memory information
    pub fn allocation_error(
        operation: &str,
        details: &str,
        requested: Option<usize>,
        available: Option<usize>,
    ) -> Self {
        Self::AllocationError {
            operation: operation.to_string(),
            details: details.to_string(),
            requested_bytes: requested,
            available_bytes: available,
        }
    }

    pub fn algorithm_unavailable(operation: &str, workspace_limit: usize) -> Self {
        Self::AlgorithmUnavailable {
            operation: operation.to_string(),
            workspace_limit,
        }
    }

    pub fn invalid_lifecycle(operation: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidLifecycle {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a backend error with operation context
    pub fn backend_error(operation: &str, details: &str) -> Self {
        Self::BackendError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    /// Create a serialization error (for call sites without an operation name)
    pub fn serialization_error_simple(details: String) -> Self {
        Self::SerializationError {
            operation: "unknown".to_string(),
            details,
        }
    }

    /// Create an IO error tied to a filesystem path
    pub fn io_error(operation: &str, details: &str, path: Option<&std::path::Path>) -> Self {
        Self::IoError {
            operation: operation.to_string(),
            details: details.to_string(),
            path: path.map(|p| p.display().to_string()),
        }
    }

    /// Get the operation name for this error
    pub fn operation(&self) -> &str {
        match self {
            Self::InvalidConfiguration { operation, .. } => operation,
            Self::ShapeMismatch { operation, .. } => operation,
            Self::InvalidShape { operation, .. } => operation,
            Self::InvalidArgument { operation, .. } => operation,
            Self::AllocationError { operation, .. } => operation,
            Self::AlgorithmUnavailable { operation, .. } => operation,
            Self::InvalidLifecycle { operation, .. } => operation,
            Self::BackendError { operation, .. } => operation,
            Self::SerializationError { operation, .. } => operation,
            Self::IoError { operation, .. } => operation,
        }
    }

    /// Check if this error can be absorbed by falling back to a zero-workspace path
    pub fn supports_fallback(&self) -> bool {
        matches!(
            self,
            Self::AllocationError { .. } | Self::AlgorithmUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;
