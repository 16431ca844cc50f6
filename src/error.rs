//! Error and diagnostic types.

use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = SketchError> = std::result::Result<T, E>;

/// Various errors raised while resolving and building a sketch.
#[derive(Debug, thiserror::Error)]
pub enum SketchError {
    #[error(transparent)]
    Io(#[from] SketchIoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The sketch path handed to the project does not exist or is not a file.
    #[error("sketch file not found: \"{0}\"")]
    SketchNotFound(PathBuf),
    /// Unbalanced or malformed preprocessor directives in a required file.
    #[error("failed to parse \"{path}\" (line {line}): {message}")]
    Parse { path: PathBuf, line: u32, message: String },
    /// An include reached from the sketch itself could not be located.
    #[error("cannot resolve include \"{name}\" from \"{from}\"")]
    UnresolvedInclude { name: String, from: PathBuf },
    /// The board configuration lacks a compile recipe the planner needs.
    #[error("missing recipe \"{0}\" in board configuration")]
    MissingRecipe(String),
    #[error("{0}")]
    Message(String),
}

impl SketchError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        SketchIoError::new(err, path).into()
    }

    pub(crate) fn msg(msg: impl std::fmt::Display) -> Self {
        SketchError::Message(msg.to_string())
    }
}

/// An `io::Error` together with the path that produced it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct SketchIoError {
    io: io::Error,
    path: PathBuf,
}

impl SketchIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which this error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<SketchIoError> for io::Error {
    fn from(err: SketchIoError) -> Self {
        err.io
    }
}

/// What part of the pipeline a [`Diagnostic`] originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    Input,
    Parse,
    Resolve,
    Expr,
    Compile,
    Link,
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A single reportable finding, aggregated into the build report.
///
/// Analysis is lenient and accumulates these instead of aborting; execution
/// is strict and turns compiler failures into error diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, ..Self::warning(kind, message) }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                write!(f, "{}:{}: {}", file.display(), line, self.message)
            }
            (Some(file), None) => write!(f, "{}: {}", file.display(), self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}
