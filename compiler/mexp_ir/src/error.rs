//! Per-call error taxonomy.
//!
//! Every failure a single macro call can hit is a value of
//! [`ExpansionPipelineError`] and becomes that call's recorded outcome. None of
//! these abort a step or a run; storage corruption is the only fatal class and
//! lives with the storage layer.

use std::fmt;

/// Why name resolution could not produce a macro definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ResolveErrorKind {
    /// No definition matches the call path.
    Unresolved,
    /// More than one definition matches the call path.
    Ambiguous,
    /// The definition exists but is disabled in this configuration.
    Disabled,
}

impl fmt::Display for ResolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveErrorKind::Unresolved => write!(f, "unresolved macro path"),
            ResolveErrorKind::Ambiguous => write!(f, "ambiguous macro path"),
            ResolveErrorKind::Disabled => write!(f, "macro definition is disabled"),
        }
    }
}

/// Category of an expander failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ExpansionErrorKind {
    /// The call's arguments do not fit the definition.
    BadArguments,
    /// The definition body is malformed for this expander.
    BadDefinition,
    /// The expander produced output that is not valid source text.
    MalformedOutput,
    /// An external expansion tool is missing or switched off.
    ToolUnavailable,
    /// An external expansion tool reported an error.
    ToolFailure,
    /// The expansion did not finish in time.
    Timeout,
}

impl ExpansionErrorKind {
    /// Whether failures of this kind depend only on the expander's inputs.
    ///
    /// Tool availability and timeouts depend on the environment, so the same
    /// inputs may succeed later.
    pub const fn is_cacheable_by_default(self) -> bool {
        !matches!(
            self,
            ExpansionErrorKind::ToolUnavailable | ExpansionErrorKind::Timeout
        )
    }
}

/// An expander failure.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct ExpansionError {
    pub kind: ExpansionErrorKind,
    pub message: String,
    /// Whether the failure may be memoized and left alone until its inputs change.
    pub cacheable: bool,
}

impl ExpansionError {
    /// Create an error whose cacheability follows its kind.
    pub fn new(kind: ExpansionErrorKind, message: impl Into<String>) -> Self {
        ExpansionError {
            kind,
            message: message.into(),
            cacheable: kind.is_cacheable_by_default(),
        }
    }

    /// Override cacheability.
    #[must_use]
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }
}

impl fmt::Display for ExpansionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ExpansionErrorKind::BadArguments => "bad macro arguments",
            ExpansionErrorKind::BadDefinition => "bad macro definition",
            ExpansionErrorKind::MalformedOutput => "malformed expansion output",
            ExpansionErrorKind::ToolUnavailable => "expansion tool unavailable",
            ExpansionErrorKind::ToolFailure => "expansion tool failed",
            ExpansionErrorKind::Timeout => "expansion timed out",
        };
        if self.message.is_empty() {
            write!(f, "{kind}")
        } else {
            write!(f, "{kind}: {}", self.message)
        }
    }
}

impl std::error::Error for ExpansionError {}

/// The recorded failure outcome of one macro call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum ExpansionPipelineError {
    /// Gated out by conditional compilation. Not an error for the user.
    CfgDisabled,
    /// The expansion capability does not exist for this call.
    Skipped,
    /// The expansion capability exists but is switched off.
    ExpansionDisabled,
    /// Name resolution failed. `transient` failures are retried.
    Unresolved {
        kind: ResolveErrorKind,
        transient: bool,
    },
    /// The call could not be normalized into expander input.
    MacroCallSyntax,
    /// The definition could not be normalized into expander input.
    MacroDefSyntax,
    /// The expander itself failed.
    Expansion(ExpansionError),
}

impl ExpansionPipelineError {
    /// Whether this outcome may stand until the call's hashes change.
    ///
    /// A non-cacheable outcome bypasses the up-to-date short-circuit and is
    /// retried on every step that has work.
    pub fn is_cacheable(&self) -> bool {
        match self {
            ExpansionPipelineError::Unresolved { transient, .. } => !transient,
            ExpansionPipelineError::Expansion(inner) => inner.cacheable,
            ExpansionPipelineError::CfgDisabled
            | ExpansionPipelineError::Skipped
            | ExpansionPipelineError::ExpansionDisabled
            | ExpansionPipelineError::MacroCallSyntax
            | ExpansionPipelineError::MacroDefSyntax => true,
        }
    }

    /// Short stable code for logs and reports.
    pub const fn code(&self) -> &'static str {
        match self {
            ExpansionPipelineError::CfgDisabled => "cfg-disabled",
            ExpansionPipelineError::Skipped => "skipped",
            ExpansionPipelineError::ExpansionDisabled => "expansion-disabled",
            ExpansionPipelineError::Unresolved { .. } => "unresolved",
            ExpansionPipelineError::MacroCallSyntax => "call-syntax",
            ExpansionPipelineError::MacroDefSyntax => "def-syntax",
            ExpansionPipelineError::Expansion(_) => "expansion",
        }
    }
}

impl fmt::Display for ExpansionPipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpansionPipelineError::CfgDisabled => {
                write!(f, "macro call is disabled by conditional compilation")
            }
            ExpansionPipelineError::Skipped => write!(f, "macro expansion is not supported here"),
            ExpansionPipelineError::ExpansionDisabled => write!(f, "macro expansion is disabled"),
            ExpansionPipelineError::Unresolved { kind, transient } => {
                write!(f, "{kind}")?;
                if *transient {
                    write!(f, " (will retry)")?;
                }
                Ok(())
            }
            ExpansionPipelineError::MacroCallSyntax => write!(f, "malformed macro call"),
            ExpansionPipelineError::MacroDefSyntax => write!(f, "malformed macro definition"),
            ExpansionPipelineError::Expansion(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for ExpansionPipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExpansionPipelineError::Expansion(inner) => Some(inner),
            _ => None,
        }
    }
}
