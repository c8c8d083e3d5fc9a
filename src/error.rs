use thiserror::Error;

use crate::modality::ModalityKind;

/// Errors raised while building or running a Play-LMP model.
///
/// None of these are recovered from internally: an error aborts the current
/// step or inference call.
#[derive(Error, Debug)]
pub enum LmpError {
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Missing required input: {0}")]
    MissingInput(&'static str),

    #[error("Length mismatch for {what}: {left} vs {right}")]
    LengthMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    #[error("Modality '{0}' appears more than once in the batch")]
    DuplicateModality(String),

    #[error("Modality '{0}' is not configured")]
    UnknownModality(String),

    #[error("Modality '{name}' is configured as {configured:?} but the batch tags it {got:?}")]
    ModalityKindMismatch {
        name: String,
        configured: ModalityKind,
        got: ModalityKind,
    },

    #[error("No validation outputs recorded for modality '{0}'")]
    MissingValidationOutputs(String),

    #[error("Batch contains no modalities")]
    EmptyBatch,

    #[error("{0} has no timesteps")]
    EmptyWindow(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LmpError>;

/// Fails with [`LmpError::ShapeMismatch`] unless `got == expected`.
pub(crate) fn ensure_width(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(LmpError::ShapeMismatch {
            what,
            expected,
            got,
        })
    }
}

/// Fails with [`LmpError::EmptyWindow`] when a `[batch, seq, ..]` tensor has `seq == 0`.
pub(crate) fn ensure_timesteps(what: &'static str, seq: usize) -> Result<()> {
    if seq == 0 {
        Err(LmpError::EmptyWindow(what))
    } else {
        Ok(())
    }
}
