use thiserror::Error;

/// Errors raised while planning or generating a kernel program.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("{op}: incompatible shapes: {reason}")]
    Shape { op: &'static str, reason: String },

    #[error("{op}: unsupported {parameter} = {value}")]
    UnsupportedConfiguration {
        op: &'static str,
        parameter: &'static str,
        value: String,
    },

    #[error("binding mismatch: {reason}")]
    BindingMismatch { reason: String },

    #[error("program metadata io: {0}")]
    Io(#[from] std::io::Error),

    #[error("program metadata serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    pub(crate) fn shape(op: &'static str, reason: impl Into<String>) -> Self {
        KernelError::Shape {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(
        op: &'static str,
        parameter: &'static str,
        value: impl std::fmt::Display,
    ) -> Self {
        KernelError::UnsupportedConfiguration {
            op,
            parameter,
            value: value.to_string(),
        }
    }

    pub(crate) fn binding(reason: impl Into<String>) -> Self {
        KernelError::BindingMismatch {
            reason: reason.into(),
        }
    }

    pub fn is_shape_error(&self) -> bool {
        matches!(self, KernelError::Shape { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, KernelError::UnsupportedConfiguration { .. })
    }

    pub fn is_binding_mismatch(&self) -> bool {
        matches!(self, KernelError::BindingMismatch { .. })
    }
}
