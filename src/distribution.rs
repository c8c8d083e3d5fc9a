//! Diagonal Gaussian distribution over latent plans

use std::f64::consts::PI;

use burn::prelude::*;
use burn::tensor::Distribution;

/// Which network produced a plan distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    /// Conditioned on the start state and goal only
    Proposal,
    /// Conditioned on the full trajectory (training only)
    Recognition,
}

/// Diagonal Gaussian over `[batch, plan_features]` latent plans,
/// parameterized by mean and log-variance.
#[derive(Debug, Clone)]
pub struct PlanDistribution<B: Backend> {
    pub mean: Tensor<B, 2>,
    pub log_var: Tensor<B, 2>,
    pub source: PlanSource,
}

impl<B: Backend> PlanDistribution<B> {
    pub fn new(mean: Tensor<B, 2>, log_var: Tensor<B, 2>, source: PlanSource) -> Self {
        Self {
            mean,
            log_var,
            source,
        }
    }

    /// Unit Gaussian with the given shape
    pub fn standard(batch_size: usize, plan_features: usize, source: PlanSource, device: &B::Device) -> Self {
        Self::new(
            Tensor::zeros([batch_size, plan_features], device),
            Tensor::zeros([batch_size, plan_features], device),
            source,
        )
    }

    pub fn dims(&self) -> [usize; 2] {
        self.mean.dims()
    }

    pub fn std(&self) -> Tensor<B, 2> {
        (self.log_var.clone() * 0.5).exp()
    }

    pub fn variance(&self) -> Tensor<B, 2> {
        self.log_var.clone().exp()
    }

    /// Reparameterized sample: gradients flow back into mean and log-variance.
    pub fn rsample(&self) -> Tensor<B, 2> {
        let eps = Tensor::<B, 2>::random(
            self.mean.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );
        self.mean.clone() + self.std() * eps
    }

    /// Sample detached from the graph
    pub fn sample(&self) -> Tensor<B, 2> {
        self.rsample().detach()
    }

    /// Log density of `plan`, summed over plan dimensions -> `[batch]`
    pub fn log_prob(&self, plan: Tensor<B, 2>) -> Tensor<B, 1> {
        let [_, plan_features] = self.dims();
        let sq = (plan - self.mean.clone()).powf_scalar(2.0) / self.variance();
        let per_example = (sq + self.log_var.clone()).sum_dim(1).squeeze::<1>(1);
        (per_example + (2.0 * PI).ln() * plan_features as f64) * -0.5
    }

    /// Differential entropy, summed over plan dimensions -> `[batch]`
    pub fn entropy(&self) -> Tensor<B, 1> {
        let [_, plan_features] = self.dims();
        let per_example = self.log_var.clone().sum_dim(1).squeeze::<1>(1);
        (per_example + (1.0 + (2.0 * PI).ln()) * plan_features as f64) * 0.5
    }

    /// `KL(self || other)` per example, summed over plan dimensions -> `[batch]`
    pub fn kl_divergence(&self, other: &PlanDistribution<B>) -> Tensor<B, 1> {
        let mean_diff = (self.mean.clone() - other.mean.clone()).powf_scalar(2.0);
        let ratio = (self.variance() + mean_diff) / other.variance();
        let per_dim = other.log_var.clone() - self.log_var.clone() + ratio - 1.0;
        (per_dim.sum_dim(1).squeeze::<1>(1)) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.mean().into_scalar().elem::<f32>()
    }

    #[test]
    fn test_kl_of_identical_is_zero() {
        let device = Default::default();
        let p = PlanDistribution::<TestBackend>::standard(4, 8, PlanSource::Recognition, &device);
        let q = PlanDistribution::<TestBackend>::standard(4, 8, PlanSource::Proposal, &device);
        assert!(scalar(p.kl_divergence(&q)).abs() < 1e-6);
    }

    #[test]
    fn test_kl_shifted_unit_gaussian() {
        let device = Default::default();
        // KL(N(1, 1) || N(0, 1)) = 0.5 per dimension
        let p = PlanDistribution::<TestBackend>::new(
            Tensor::ones([2, 8], &device),
            Tensor::zeros([2, 8], &device),
            PlanSource::Recognition,
        );
        let q = PlanDistribution::<TestBackend>::standard(2, 8, PlanSource::Proposal, &device);
        let kl = p.kl_divergence(&q);
        assert_eq!(kl.dims(), [2]);
        assert!((scalar(kl) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_kl_different_variance() {
        let device = Default::default();
        // KL(N(0, e^1) || N(0, 1)) = 0.5 * (e - 1 - 1) per dimension
        let p = PlanDistribution::<TestBackend>::new(
            Tensor::zeros([1, 3], &device),
            Tensor::ones([1, 3], &device),
            PlanSource::Recognition,
        );
        let q = PlanDistribution::<TestBackend>::standard(1, 3, PlanSource::Proposal, &device);
        let expected = 3.0 * 0.5 * (std::f32::consts::E - 2.0);
        assert!((scalar(p.kl_divergence(&q)) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_log_prob_and_entropy_of_unit_gaussian() {
        let device = Default::default();
        let dist = PlanDistribution::<TestBackend>::standard(1, 4, PlanSource::Proposal, &device);
        let at_mean = scalar(dist.log_prob(Tensor::zeros([1, 4], &device)));
        let expected = -0.5 * 4.0 * (2.0 * std::f32::consts::PI).ln();
        assert!((at_mean - expected).abs() < 1e-4);

        let entropy = scalar(dist.entropy());
        let expected = 0.5 * 4.0 * (1.0 + (2.0 * std::f32::consts::PI).ln());
        assert!((entropy - expected).abs() < 1e-4);
    }

    #[test]
    fn test_sample_shape() {
        let device = Default::default();
        let dist = PlanDistribution::<TestBackend>::standard(3, 5, PlanSource::Proposal, &device);
        assert_eq!(dist.sample().dims(), [3, 5]);
        assert_eq!(dist.rsample().dims(), [3, 5]);
    }

    #[test]
    fn test_rsample_is_differentiable() {
        type AD = Autodiff<TestBackend>;
        let device = Default::default();
        let mean = Tensor::<AD, 2>::zeros([2, 3], &device).require_grad();
        let log_var = Tensor::<AD, 2>::zeros([2, 3], &device).require_grad();
        let dist = PlanDistribution::new(mean.clone(), log_var, PlanSource::Recognition);

        let grads = dist.rsample().sum().backward();
        let mean_grad = mean.grad(&grads).expect("mean receives a gradient");
        let values = mean_grad.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|g| (g - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_sample_is_detached() {
        type AD = Autodiff<TestBackend>;
        let device = Default::default();
        let mean = Tensor::<AD, 2>::zeros([2, 3], &device).require_grad();
        let log_var = Tensor::<AD, 2>::zeros([2, 3], &device).require_grad();
        let dist = PlanDistribution::new(mean.clone(), log_var, PlanSource::Proposal);

        let loss = dist.sample().sum() + mean.clone().sum() * 0.0;
        let grads = loss.backward();
        let values = mean
            .grad(&grads)
            .map(|g| g.into_data().to_vec::<f32>().unwrap())
            .unwrap_or_default();
        assert!(values.iter().all(|g| g.abs() < 1e-6));
    }
}
