//! Plan proposal and plan recognition networks

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;

use super::mlp::Mlp;
use super::{PlanProposal, PlanRecognition};
use crate::config::PlanNetworkConfig;
use crate::distribution::{PlanDistribution, PlanSource};

/// Mean and log-variance heads sharing one trunk output
#[derive(Module, Debug)]
pub struct GaussianHead<B: Backend> {
    mean: Linear<B>,
    log_var: Linear<B>,
    /// Floor on log-variance derived from the configured minimum std
    min_log_var: f64,
}

impl<B: Backend> GaussianHead<B> {
    fn new(device: &B::Device, hidden_size: usize, plan_features: usize, min_std: f64) -> Self {
        Self {
            mean: LinearConfig::new(hidden_size, plan_features).init(device),
            log_var: LinearConfig::new(hidden_size, plan_features).init(device),
            min_log_var: 2.0 * min_std.max(f64::MIN_POSITIVE).ln(),
        }
    }

    fn forward(&self, x: Tensor<B, 2>, source: PlanSource) -> PlanDistribution<B> {
        let mean = self.mean.forward(x.clone());
        let log_var = self.log_var.forward(x).clamp_min(self.min_log_var);
        PlanDistribution::new(mean, log_var, source)
    }
}

/// `[start_emb, latent_goal]` -> plan distribution
#[derive(Module, Debug)]
pub struct PlanProposalNetwork<B: Backend> {
    trunk: Mlp<B>,
    activation: Relu,
    head: GaussianHead<B>,
}

impl<B: Backend> PlanProposalNetwork<B> {
    pub fn new(
        device: &B::Device,
        perceptual_features: usize,
        latent_goal_features: usize,
        plan_features: usize,
        config: &PlanNetworkConfig,
    ) -> Self {
        Self {
            trunk: Mlp::new(
                device,
                perceptual_features + latent_goal_features,
                config.hidden_size,
                config.num_layers,
                config.hidden_size,
            ),
            activation: Relu::new(),
            head: GaussianHead::new(device, config.hidden_size, plan_features, config.min_std),
        }
    }
}

impl<B: Backend> PlanProposal<B> for PlanProposalNetwork<B> {
    fn propose(&self, start_emb: Tensor<B, 2>, latent_goal: Tensor<B, 2>) -> PlanDistribution<B> {
        let x = Tensor::cat(vec![start_emb, latent_goal], 1);
        let x = self.activation.forward(self.trunk.forward(x));
        self.head.forward(x, PlanSource::Proposal)
    }
}

/// Embedding sequence -> plan distribution.
///
/// Each timestep is encoded independently, then the sequence is summarized by
/// its mean and its final step.
#[derive(Module, Debug)]
pub struct PlanRecognitionNetwork<B: Backend> {
    step_encoder: Mlp<B>,
    trunk: Mlp<B>,
    activation: Relu,
    head: GaussianHead<B>,
}

impl<B: Backend> PlanRecognitionNetwork<B> {
    pub fn new(
        device: &B::Device,
        perceptual_features: usize,
        plan_features: usize,
        config: &PlanNetworkConfig,
    ) -> Self {
        let hidden = config.hidden_size;
        Self {
            step_encoder: Mlp::new(device, perceptual_features, hidden, 1, hidden),
            trunk: Mlp::new(device, hidden * 2, hidden, config.num_layers, hidden),
            activation: Relu::new(),
            head: GaussianHead::new(device, hidden, plan_features, config.min_std),
        }
    }
}

impl<B: Backend> PlanRecognition<B> for PlanRecognitionNetwork<B> {
    fn recognize(&self, perceptual_emb: Tensor<B, 3>) -> PlanDistribution<B> {
        let steps = self.activation.forward(self.step_encoder.forward(perceptual_emb));
        let [batch, seq, hidden] = steps.dims();

        let mean = steps.clone().mean_dim(1).reshape([batch, hidden]);
        let last = steps.slice([0..batch, seq - 1..seq, 0..hidden]).reshape([batch, hidden]);

        let x = Tensor::cat(vec![mean, last], 1);
        let x = self.activation.forward(self.trunk.forward(x));
        self.head.forward(x, PlanSource::Recognition)
    }
}
