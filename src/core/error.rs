use std::io;

/// A configuration value that is missing or out of range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DelayError {
    #[error("delay of {delay} ticks is outside the representable range 1..{capacity}")]
    OutOfRange { delay: usize, capacity: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Delay(#[from] DelayError),

    /// The memory image describes a different network than the one configured.
    #[error("checkpoint does not match configuration: {0}")]
    CheckpointMismatch(String),

    /// The memory image is truncated or malformed.
    #[error("corrupt checkpoint: {0}")]
    CheckpointCorrupt(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = SimError> = core::result::Result<T, E>;
