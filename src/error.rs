use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use ndarray::ShapeError;
use safetensors::SafeTensorError;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, RetrainErr>;

/// The crate's error type.
#[derive(Debug)]
pub enum RetrainErr {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Json(serde_json::Error),
    MissingChoice {
        key: String,
    },
    InvalidChoice {
        key: String,
        reason: String,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Shape(ShapeError),
    /// `backward` was called without a matching training `forward`.
    MissingForward(&'static str),
    Dataset(String),
    Checkpoint(SafeTensorError),
    /// A checkpoint tensor this crate can't load.
    UnsupportedTensor {
        name: String,
        dtype: String,
    },
    InvalidConfig(String),
}

impl RetrainErr {
    /// Wraps an io error together with the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_choice(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidChoice {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for RetrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrainErr::Io { path, source } => write!(f, "io error on '{}': {source}", path.display()),
            RetrainErr::Json(e) => write!(f, "invalid architecture json: {e}"),
            RetrainErr::MissingChoice { key } => {
                write!(f, "the fixed architecture has no value for choice '{key}'")
            }
            RetrainErr::InvalidChoice { key, reason } => {
                write!(f, "invalid value for choice '{key}': {reason}")
            }
            RetrainErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            RetrainErr::Shape(e) => write!(f, "shape error: {e}"),
            RetrainErr::MissingForward(what) => {
                write!(f, "{what} has no training forward pass to backpropagate through")
            }
            RetrainErr::Dataset(msg) => write!(f, "dataset error: {msg}"),
            RetrainErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            RetrainErr::UnsupportedTensor { name, dtype } => {
                write!(f, "checkpoint tensor '{name}' is {dtype}, only F32 is supported")
            }
            RetrainErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for RetrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RetrainErr::Io { source, .. } => Some(source),
            RetrainErr::Json(e) => Some(e),
            RetrainErr::Shape(e) => Some(e),
            RetrainErr::Checkpoint(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RetrainErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ShapeError> for RetrainErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<SafeTensorError> for RetrainErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Checkpoint(value)
    }
}
