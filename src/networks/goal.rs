use burn::module::Module;
use burn::prelude::*;

use super::mlp::Mlp;
use super::{LanguageGoal, VisualGoal};
use crate::config::{GoalEncoderConfig, LanguageGoalConfig};

/// Perceptual embedding of the goal frame -> latent goal
#[derive(Module, Debug)]
pub struct VisualGoalEncoder<B: Backend> {
    mlp: Mlp<B>,
}

impl<B: Backend> VisualGoalEncoder<B> {
    pub fn new(
        device: &B::Device,
        perceptual_features: usize,
        latent_goal_features: usize,
        config: &GoalEncoderConfig,
    ) -> Self {
        Self {
            mlp: Mlp::new(
                device,
                perceptual_features,
                config.hidden_size,
                2,
                latent_goal_features,
            ),
        }
    }
}

impl<B: Backend> VisualGoal<B> for VisualGoalEncoder<B> {
    fn encode_goal(&self, perceptual_emb: Tensor<B, 2>) -> Tensor<B, 2> {
        self.mlp.forward(perceptual_emb)
    }
}

/// Sentence embedding of the instruction -> latent goal
#[derive(Module, Debug)]
pub struct LanguageGoalEncoder<B: Backend> {
    mlp: Mlp<B>,
}

impl<B: Backend> LanguageGoalEncoder<B> {
    pub fn new(
        device: &B::Device,
        latent_goal_features: usize,
        config: &LanguageGoalConfig,
    ) -> Self {
        Self {
            mlp: Mlp::new(
                device,
                config.lang_features,
                config.hidden_size,
                2,
                latent_goal_features,
            ),
        }
    }
}

impl<B: Backend> LanguageGoal<B> for LanguageGoalEncoder<B> {
    fn encode_goal(&self, lang: Tensor<B, 2>) -> Tensor<B, 2> {
        self.mlp.forward(lang)
    }
}
