pub type TexcastResult<T> = Result<T, TexcastError>;

/// Maximum length of a diagnostic excerpt surfaced to callers.
///
/// Full tool logs are captured (up to the invoker's output cap) but callers
/// only ever see a bounded excerpt, never a raw process dump.
pub const MAX_DIAGNOSTIC_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessErrorKind {
    SpawnFailure,
    Timeout,
    KilledBySignal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    SyntaxError,
    MissingPackage,
    ToolingInconsistency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionErrorKind {
    UnsupportedFormat,
    ToolFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyErrorKind {
    EmptySequence,
    DimensionMismatch,
    EncodingFailure,
}

#[derive(thiserror::Error, Debug)]
pub enum TexcastError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("process error ({kind:?}): {message}")]
    Process {
        kind: ProcessErrorKind,
        message: String,
    },

    #[error("compile error ({kind:?}): {diagnostics}")]
    Compile {
        kind: CompileErrorKind,
        diagnostics: String,
    },

    #[error("conversion error ({kind:?}): {message}")]
    Conversion {
        kind: ConversionErrorKind,
        message: String,
    },

    #[error("assembly error ({kind:?}): {message}")]
    Assembly {
        kind: AssemblyErrorKind,
        message: String,
    },

    #[error("cache consistency error: {0}")]
    CacheConsistency(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TexcastError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn process(kind: ProcessErrorKind, msg: impl Into<String>) -> Self {
        Self::Process {
            kind,
            message: msg.into(),
        }
    }

    pub fn compile(kind: CompileErrorKind, diagnostics: impl Into<String>) -> Self {
        Self::Compile {
            kind,
            diagnostics: truncate_diagnostic(&diagnostics.into()),
        }
    }

    pub fn conversion(kind: ConversionErrorKind, msg: impl Into<String>) -> Self {
        Self::Conversion {
            kind,
            message: truncate_diagnostic(&msg.into()),
        }
    }

    pub fn assembly(kind: AssemblyErrorKind, msg: impl Into<String>) -> Self {
        Self::Assembly {
            kind,
            message: truncate_diagnostic(&msg.into()),
        }
    }

    pub fn cache_consistency(msg: impl Into<String>) -> Self {
        Self::CacheConsistency(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Clone an error for delivery to coalesced waiters.
    ///
    /// All structured variants reproduce exactly (kind tags preserved);
    /// `Other` is flattened to its rendered message since `anyhow::Error`
    /// itself is not cloneable.
    pub fn clone_for_waiter(&self) -> Self {
        match self {
            Self::Validation(m) => Self::Validation(m.clone()),
            Self::Process { kind, message } => Self::Process {
                kind: *kind,
                message: message.clone(),
            },
            Self::Compile { kind, diagnostics } => Self::Compile {
                kind: *kind,
                diagnostics: diagnostics.clone(),
            },
            Self::Conversion { kind, message } => Self::Conversion {
                kind: *kind,
                message: message.clone(),
            },
            Self::Assembly { kind, message } => Self::Assembly {
                kind: *kind,
                message: message.clone(),
            },
            Self::CacheConsistency(m) => Self::CacheConsistency(m.clone()),
            Self::Cancelled(m) => Self::Cancelled(m.clone()),
            Self::Other(e) => Self::Other(anyhow::anyhow!("{e:#}")),
        }
    }
}

/// Bound a diagnostic string to [`MAX_DIAGNOSTIC_LEN`], cutting on a char
/// boundary and marking the cut.
pub fn truncate_diagnostic(s: &str) -> String {
    if s.len() <= MAX_DIAGNOSTIC_LEN {
        return s.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [... truncated]", &s[..end])
}
