//! Embedder-facing errors.

use opal_compiler::CompileError;

/// Why a run failed: the source did not compile, or an exception
/// propagated past the module frame (interpreter status EXCEPTION).
#[derive(Debug, Clone)]
pub enum OpalError {
    Compile(CompileError),
    Uncaught {
        exception_type: String,
        message: String,
    },
}

impl OpalError {
    pub(crate) fn from_compile(e: CompileError) -> Self {
        OpalError::Compile(e)
    }

    pub(crate) fn uncaught(exception_type: String, message: String) -> Self {
        OpalError::Uncaught {
            exception_type,
            message,
        }
    }

    /// The exception type name for uncaught errors.
    pub fn exception_type(&self) -> Option<&str> {
        match self {
            OpalError::Uncaught { exception_type, .. } => Some(exception_type),
            OpalError::Compile(_) => None,
        }
    }
}

impl std::fmt::Display for OpalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpalError::Compile(e) => write!(f, "compile error: {e}"),
            OpalError::Uncaught {
                exception_type,
                message,
            } => {
                if message.is_empty() {
                    write!(f, "{exception_type}")
                } else {
                    write!(f, "{exception_type}: {message}")
                }
            }
        }
    }
}

impl std::error::Error for OpalError {}
