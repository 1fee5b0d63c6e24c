//! Error surface of the glue layer

use weft_vm::{DefineError, VmError};

/// Phase in which a glue build aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GluePhase {
    /// Collecting members, signatures, and indices
    Layout,
    /// Emitting the class image
    Emit,
    /// Verification or installation of the emitted image
    Verify,
}

impl std::fmt::Display for GluePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GluePhase::Layout => "layout",
            GluePhase::Emit => "emit",
            GluePhase::Verify => "verify",
        })
    }
}

/// Why a host cannot be enhanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotEnhanceableReason {
    /// The host class is final
    Final,
    /// The host cannot be subclassed (interface, unnamed, no visible constructor)
    Forbidden,
}

impl std::fmt::Display for NotEnhanceableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NotEnhanceableReason::Final => "final",
            NotEnhanceableReason::Forbidden => "forbidden",
        })
    }
}

/// Errors produced by glue builds.
#[derive(Debug, thiserror::Error)]
pub enum AopError {
    /// No class-definition strategy is viable in this process
    #[error("class defining unavailable")]
    ClassDefiningUnavailable,

    /// The selected strategy failed a specific define call
    #[error("class defining failed: {0}")]
    ClassDefiningFailed(#[from] DefineError),

    /// A glue build aborted
    #[error("glue generation failed in {phase} phase for {host} (proxy {proxy}): {source}")]
    GlueGenerationFailed {
        /// Build phase that failed
        phase: GluePhase,
        /// Host class name
        host: String,
        /// Proxy class name
        proxy: String,
        /// Underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The host cannot be subclassed
    #[error("host {host} is not enhanceable: {reason}")]
    HostNotEnhanceable {
        /// Host class name
        host: String,
        /// Rejection reason
        reason: NotEnhanceableReason,
    },

    /// Resolver or metadata errors are surfaced verbatim
    #[error(transparent)]
    Platform(#[from] VmError),
}

/// Result alias for glue operations.
pub type AopResult<T> = Result<T, AopError>;
