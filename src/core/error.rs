//! Error taxonomy shared by the bridge, the compute service and the renderers.
//!
//! Recoverable emptiness (no model yet, no response data yet) is modelled as
//! `Option::None` at the call sites, never as an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VizError {
    /// An operation that needs a model context ran before `initialize`.
    #[error("compute context is not initialized")]
    NotInitialized,

    /// The response matrix only exists for 2-input/1-output networks.
    #[error("response matrix needs a 2-input/1-output network (got {inputs} inputs, {outputs} outputs)")]
    UnsupportedTopology { inputs: usize, outputs: usize },

    /// A color/weight/sample buffer whose length does not fit the protocol.
    #[error("malformed {what} buffer: {len} bytes does not fit unit {unit}")]
    MalformedBuffer {
        what: String,
        len: usize,
        unit: usize,
    },

    #[error("invalid network definition: {0}")]
    InvalidDefinition(String),

    #[error("cannot rebuild the model while training is in progress")]
    TrainingInProgress,

    /// The compute thread is gone (its request channel is closed).
    #[error("compute service is unavailable")]
    ServiceUnavailable,

    /// Panels spawn their fetches on the ambient tokio runtime.
    #[error("no tokio runtime is running")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("canvas: {0}")]
    Canvas(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VizError {
    pub(crate) fn malformed(what: impl Into<String>, len: usize, unit: usize) -> Self {
        VizError::MalformedBuffer {
            what: what.into(),
            len,
            unit,
        }
    }

    /// Protocol-level failures that must never be papered over.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VizError::NotInitialized
                | VizError::UnsupportedTopology { .. }
                | VizError::MalformedBuffer { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VizError>;
