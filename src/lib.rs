pub mod config;
pub mod dataset;
pub mod distribution;
pub mod error;
pub mod metrics;
pub mod modality;
pub mod model;
pub mod networks;
pub mod rollout;
pub mod training;

// Re-export commonly used types for convenience
pub use config::{InputSizes, PlayLmpConfig};
pub use distribution::{PlanDistribution, PlanSource};
pub use error::{LmpError, Result};
pub use modality::{Frame, ModalityBatch, ModalityKind, ModalitySpec, StepBatch};
pub use model::PlayLmp;
pub use rollout::{RolloutConfig, RolloutPolicy};
pub use training::{TrainConfig, Trainer};
