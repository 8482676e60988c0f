//! Failure taxonomy for patch jobs.

use crate::job::JobStage;
use thiserror::Error;

/// Errors a patch job can terminate with.
///
/// Every stage reports one of these to the coordinator, which records it
/// together with the stage it happened in.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The upload is not a usable APK.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Workspace allocation hit a disk or inode limit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An external transform process exceeded its wall-clock budget.
    #[error("{stage} timed out after {seconds}s")]
    TransformTimeout { stage: JobStage, seconds: u64 },

    #[error("{stage} failed: {diagnostics}")]
    TransformFailed { stage: JobStage, diagnostics: String },

    /// The intermediate tree lacks the structure injection writes into.
    #[error("injection target missing: {0}")]
    InjectionTargetMissing(String),

    /// The configured entry class or method is absent.
    #[error("entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("service busy")]
    Busy,

    /// Client went away or the job deadline elapsed.
    #[error("job cancelled")]
    Cancelled,

    #[error("io error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable identifier used in logs and JSON responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::TransformTimeout { .. } => "transform_timeout",
            Self::TransformFailed { .. } => "transform_failed",
            Self::InjectionTargetMissing(_) => "injection_target_missing",
            Self::EntryPointNotFound(_) => "entry_point_not_found",
            Self::SigningFailed(_) => "signing_failed",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Io { .. } => "io",
        }
    }

    /// True when the caller can fix the problem by sending a different APK.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::EntryPointNotFound(_)
                | Self::TransformFailed {
                    stage: JobStage::Decompiling,
                    ..
                }
        )
    }
}

pub type PatchResult<T> = std::result::Result<T, PatchError>;
