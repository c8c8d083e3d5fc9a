//! Plan-conditioned action decoder

use burn::module::Module;
use burn::prelude::*;

use super::ActionDecoding;
use super::mlp::Mlp;
use crate::config::DecoderConfig;

/// Decodes one action per timestep from `[plan, perceptual_emb_t, latent_goal]`.
///
/// The last action dimension is the gripper command and is squashed to
/// `(-1, 1)`; the others are unbounded.
#[derive(Module, Debug)]
pub struct ActionDecoder<B: Backend> {
    mlp: Mlp<B>,
    out_features: usize,
}

impl<B: Backend> ActionDecoder<B> {
    pub fn new(
        device: &B::Device,
        plan_features: usize,
        perceptual_features: usize,
        latent_goal_features: usize,
        config: &DecoderConfig,
    ) -> Self {
        Self {
            mlp: Mlp::new(
                device,
                plan_features + perceptual_features + latent_goal_features,
                config.hidden_size,
                config.num_layers,
                config.out_features,
            ),
            out_features: config.out_features,
        }
    }

    /// Predicted actions `[batch, seq, out_features]`
    pub fn forward(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let [batch, seq, _] = perceptual_emb.dims();
        let plan = plan.unsqueeze_dim::<3>(1).repeat_dim(1, seq);
        let goal = latent_goal.unsqueeze_dim::<3>(1).repeat_dim(1, seq);

        let x = Tensor::cat(vec![plan, perceptual_emb, goal], 2);
        let raw = self.mlp.forward(x);

        let n = self.out_features;
        let continuous = raw.clone().slice([0..batch, 0..seq, 0..n - 1]);
        let gripper = raw.slice([0..batch, 0..seq, n - 1..n]).tanh();
        Tensor::cat(vec![continuous, gripper], 2)
    }
}

impl<B: Backend> ActionDecoding<B> for ActionDecoder<B> {
    fn loss(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> Tensor<B, 1> {
        self.loss_and_act(plan, perceptual_emb, latent_goal, actions).0
    }

    fn loss_and_act(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> (Tensor<B, 1>, Tensor<B, 3>) {
        let predicted = self.forward(plan, perceptual_emb, latent_goal);
        let loss = (predicted.clone() - actions).powf_scalar(2.0).mean();
        (loss, predicted)
    }

    fn act(
        &self,
        plan: Tensor<B, 2>,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let predicted = self.forward(plan, perceptual_emb, latent_goal);
        let [batch, seq, n] = predicted.dims();
        predicted
            .slice([0..batch, seq - 1..seq, 0..n])
            .reshape([batch, n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    fn decoder(device: &<TestBackend as Backend>::Device) -> ActionDecoder<TestBackend> {
        let config = DecoderConfig::new().with_hidden_size(16);
        ActionDecoder::new(device, 4, 10, 3, &config)
    }

    #[test]
    fn test_loss_and_act_shapes() {
        let device = Default::default();
        let decoder = decoder(&device);

        let (loss, actions) = decoder.loss_and_act(
            Tensor::zeros([2, 4], &device),
            Tensor::zeros([2, 5, 10], &device),
            Tensor::zeros([2, 3], &device),
            Tensor::zeros([2, 5, 7], &device),
        );
        assert_eq!(loss.dims(), [1]);
        assert_eq!(actions.dims(), [2, 5, 7]);
    }

    #[test]
    fn test_gripper_is_bounded() {
        let device = Default::default();
        let decoder = decoder(&device);

        let actions = decoder.forward(
            Tensor::ones([2, 4], &device) * 50.0,
            Tensor::ones([2, 5, 10], &device) * -50.0,
            Tensor::ones([2, 3], &device) * 50.0,
        );
        let gripper = actions.slice([0..2, 0..5, 6..7]).abs().max();
        assert!(gripper.into_scalar().elem::<f32>() <= 1.0);
    }

    #[test]
    fn test_act_returns_last_step() {
        let device = Default::default();
        let decoder = decoder(&device);
        let plan = Tensor::ones([1, 4], &device);
        let emb = Tensor::ones([1, 3, 10], &device);
        let goal = Tensor::ones([1, 3], &device);

        let sequence = decoder.forward(plan.clone(), emb.clone(), goal.clone());
        let last = sequence.slice([0..1, 2..3, 0..7]).reshape([1, 7]);
        let action = decoder.act(plan, emb, goal);

        assert_eq!(action.dims(), [1, 7]);
        let action = action.into_data().to_vec::<f32>().unwrap();
        let last = last.into_data().to_vec::<f32>().unwrap();
        for (a, b) in action.iter().zip(&last) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
