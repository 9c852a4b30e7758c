//! Error types for the build engine

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors raised by the engine and by user rules
///
/// Every variant is cheaply cloneable: build results are fanned out to all
/// concurrent demanders of a key, so failures travel through shared fences.
#[derive(Error, Debug, Clone)]
pub enum BuildError {
    /// `apply` was called in a context where new dependencies may not be
    /// introduced (inside `with_resource` or `extra_thread`)
    #[error("apply is not allowed {0}")]
    NoApplyHere(String),

    /// No rule is registered for the demanded key type
    #[error("no rule to build key {key}, expected result of type {}", .result_type.as_deref().unwrap_or("unknown"))]
    NoRuleToBuild {
        /// First demanded key without a rule
        key: String,
        /// The value type the caller asked for, when known
        result_type: Option<String>,
    },

    /// The value type requested at `apply` differs from the registered rule's
    /// result type
    #[error("rule for key {key} produces {registered}, but {declared} was requested")]
    RuleTypeMismatch {
        /// The offending key
        key: String,
        /// Value type requested by the caller
        declared: String,
        /// Value type registered for the rule
        registered: String,
    },

    /// A dependency chain reached a key already being built on the same chain
    #[error("dependency cycle detected:\n{}", .keys.join("\n"))]
    CycleDetected {
        /// The chain of keys, outermost first, ending with the repeated key
        keys: Vec<String>,
    },

    /// A resource request exceeded the resource's total capacity
    #[error("acquiring {requested} from resource {resource} can never succeed, capacity is {capacity}")]
    ResourceOverCapacity {
        /// Resource name
        resource: String,
        /// Requested quantity
        requested: usize,
        /// Total capacity of the resource
        capacity: usize,
    },

    /// The working directory drifted between rules (lint mode)
    #[error("lint: working directory changed during the build\n  Wanted: {wanted}\n  Got: {got}")]
    LintCwdChanged {
        /// Directory at the start of the build
        wanted: String,
        /// Directory observed after a rule finished
        got: String,
    },

    /// Keys recorded by `track_use` never became dependencies of the rule
    #[error("lint: keys used but not depended upon: {}", .keys.join(", "))]
    LintUsedNotDepended {
        /// The offending keys
        keys: Vec<String>,
    },

    /// Keys recorded by `track_use` were themselves built, so they were
    /// depended upon after being used
    #[error("lint: keys depended upon after being used: {}", .keys.join(", "))]
    LintDependedAfterUsed {
        /// The offending keys
        keys: Vec<String>,
    },

    /// A post-build lint validation failed
    #[error("lint: {0}")]
    LintFailure(String),

    /// The action was abandoned because an earlier failure cancelled the build
    #[error("build cancelled after an earlier failure")]
    Cancelled,

    /// A failure raised from user action code
    #[error("{0}")]
    UserError(String),

    /// An engine invariant was violated
    #[error("internal engine invariant violated: {0}")]
    Internal(String),

    /// An error already annotated with its build context; never re-wrapped
    #[error("{0}")]
    Structured(StructuredError),
}

impl BuildError {
    /// Shorthand for a [`BuildError::UserError`]
    pub fn user(msg: impl Into<String>) -> Self {
        BuildError::UserError(msg.into())
    }

    /// Shorthand for a [`BuildError::Internal`]
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        BuildError::Internal(msg.into())
    }

    /// Whether this error only reports cancellation of already-doomed work
    pub fn is_cancelled(&self) -> bool {
        match self {
            BuildError::Cancelled => true,
            BuildError::Structured(s) => s.inner.is_cancelled(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::UserError(err.to_string())
    }
}

impl From<anyhow::Error> for BuildError {
    fn from(err: anyhow::Error) -> Self {
        BuildError::UserError(format!("{err:#}"))
    }
}

impl From<String> for BuildError {
    fn from(msg: String) -> Self {
        BuildError::UserError(msg)
    }
}

impl From<&str> for BuildError {
    fn from(msg: &str) -> Self {
        BuildError::UserError(msg.to_string())
    }
}

/// A failure annotated with the key chain that led to it
///
/// `target` is the innermost key being built (or a label such as
/// `"Top-level action"` when the failure happened outside any rule), `stack`
/// the full chain outermost-first, and `inner` the original cause.
#[derive(Debug, Clone)]
pub struct StructuredError {
    /// What was being built when the failure happened
    pub target: String,
    /// Key chain from the top-level demand down to the target
    pub stack: Vec<String>,
    /// The original failure
    pub inner: Arc<BuildError>,
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error building {}", self.target)?;
        if !self.stack.is_empty() {
            writeln!(f, "  stack:")?;
            for frame in &self.stack {
                writeln!(f, "    {frame}")?;
            }
        }
        write!(f, "  cause: {}", self.inner)
    }
}
