//! Training and validation around the Play-LMP model
//!
//! ```text
//! StepSource ──► training_step ──► total_loss.backward() ──► AdamW step
//!      │
//!      └──────► validation_step ──► ValidationAccumulator ──► epoch means
//! ```

pub mod kl_schedule;
pub mod step;
pub mod trainer;
pub mod validation;

pub use kl_schedule::KlAnnealing;
pub use step::{ModalityValOutput, TrainStepOutput, ValidationStepOutput};
pub use trainer::{FitSummary, StepSource, TrainConfig, Trainer};
pub use validation::{
    ValidationAccumulator, ValidationMetrics, ValidationSummary, validation_epoch_end,
};
