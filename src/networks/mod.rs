//! Sub-networks composed by the Play-LMP model
//!
//! Each network is reached through a small trait describing what it maps
//! from and to, so the latent-plan logic in [`crate::model`] can run against
//! any implementation. The burn modules in this directory are the default
//! implementations.
//!
//! ```text
//!  images ──▶ ImageEncoder ─┐
//!                           ├─▶ perceptual embedding ──┬─▶ PlanRecognition ─┐
//!  robot_obs ───────────────┘        │                 │                    ├─▶ plan ─▶ ActionDecoding
//!                                    ▼                 └─▶ PlanProposal ────┘
//!                     VisualGoal / LanguageGoal ──▶ latent goal ──────────────────────▲
//! ```

pub mod decoder;
pub mod goal;
pub mod mlp;
pub mod plan;
pub mod vision;

use burn::prelude::*;

use crate::distribution::PlanDistribution;

pub use decoder::ActionDecoder;
pub use goal::{LanguageGoalEncoder, VisualGoalEncoder};
pub use mlp::Mlp;
pub use plan::{PlanProposalNetwork, PlanRecognitionNetwork};
pub use vision::VisionNetwork;

/// Maps a flattened image batch `[n, c, h, w]` to embeddings `[n, features]`
pub trait ImageEncoder<B: Backend> {
    fn output_features(&self) -> usize;
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Maps one perceptual embedding per example `[batch, f]` to a latent goal
pub trait VisualGoal<B: Backend> {
    fn encode_goal(&self, perceptual_emb: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Maps a sentence embedding `[batch, lang]` to a latent goal
pub trait LanguageGoal<B: Backend> {
    fn encode_goal(&self, lang: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Plan distribution from the start embedding and latent goal
pub trait PlanProposal<B: Backend> {
    fn propose(&self, start_emb: Tensor<B, 2>, latent_goal: Tensor<B, 2>) -> PlanDistribution<B>;
}

/// Plan distribution from a whole embedding sequence `[batch, seq, f]`
pub trait PlanRecognition<B: Backend> {
    fn recognize(&self, perceptual_emb: Tensor<B, 3>) -> PlanDistribution<B>;
}

/// Action decoder conditioned on a latent plan and goal
pub trait ActionDecoding<B: Backend> {
    /// Scalar reconstruction loss against ground-truth `actions`
    fn loss(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> Tensor<B, 1>;

    /// Loss plus the predicted action sequence `[batch, seq, action_dim]`
    fn loss_and_act(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> (Tensor<B, 1>, Tensor<B, 3>);

    /// Action for the latest timestep `[batch, action_dim]`
    fn act(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
    ) -> Tensor<B, 2>;
}
