//! Crate-wide error model.
//!
//! Three kinds are distinguished per the facade's failure policy: a
//! construction-time [`Error::Multi`] aggregate, a per-call
//! [`Error::ModuleNotInitialized`] for metrics whose substore never came up,
//! and a capability-gated [`Error::MetricNotSupported`]. Everything else is
//! an ordinary contextual error.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Emitted only by [`crate::facade::Builder::build`]; wraps every
    /// substore initialization failure encountered along the way.
    #[error("{} sub-store(s) failed to initialize: {}", .0.len(), join_display(.0))]
    Multi(Vec<Error>),

    /// A metric method was called whose owning sub-store is not live.
    #[error("module `{module}` is not initialized")]
    ModuleNotInitialized { module: &'static str },

    /// A capability-gated metric was requested on an unsupported CPU model.
    #[error("metric `{metric}` is not supported on CPU model {model:#x}")]
    MetricNotSupported { metric: &'static str, model: u32 },

    /// The computed file-descriptor requirement for a perf activation
    /// exceeds the kernel cap or the process soft limit.
    #[error("perf activation needs {required} file descriptors, limit is {limit}")]
    FdBudgetExceeded { required: u128, limit: u128 },

    /// A read landed past the end of a fixed-size register or file.
    #[error("offset {offset:#x} is out of bounds for {context}")]
    OutOfBounds { context: String, offset: u64 },

    /// A blocking read did not complete before its timeout elapsed.
    #[error("{context} timed out")]
    Timeout { context: String },

    /// An event name did not resolve against the loaded perf JSON bundle.
    #[error("perf event `{name}` did not resolve")]
    UnknownPerfEvent { name: String },

    /// A reference counter used in a ratio/percentage formula was zero.
    #[error("{context}: reference counter was zero")]
    ZeroReference { context: String },

    /// Ordinary I/O failure, tagged with what we were trying to do.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Ordinary parse failure, tagged with what we were trying to parse.
    #[error("{context}: failed to parse `{input}`")]
    Parse { context: String, input: String },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn parse(context: impl Into<String>, input: impl Into<String>) -> Self {
        Error::Parse {
            context: context.into(),
            input: input.into(),
        }
    }
}

fn join_display(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accumulates per-sub-store failures during facade construction so one
/// failing sub-store doesn't abort the rest of the initializations.
#[derive(Default)]
pub struct MultiErrorBuilder {
    errors: Vec<Error>,
}

impl MultiErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn push_result<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.errors.push(error);
                None
            }
        }
    }

    /// Returns `Some(Error::Multi)` iff any failure was recorded.
    pub fn finish(self) -> Option<Error> {
        if self.errors.is_empty() {
            None
        } else {
            Some(Error::Multi(self.errors))
        }
    }
}

impl fmt::Debug for MultiErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiErrorBuilder")
            .field("errors", &self.errors)
            .finish()
    }
}
