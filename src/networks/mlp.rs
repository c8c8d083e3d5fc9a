use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Relu};
use burn::prelude::*;

/// Fully connected stack with ReLU between layers and a linear output
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    /// Input layer
    input: Linear<B>,
    /// Hidden layers
    hidden: Vec<Linear<B>>,
    /// Output layer
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> Mlp<B> {
    /// `num_layers` counts the hidden activations; at least one is always built.
    pub fn new(
        device: &B::Device,
        in_features: usize,
        hidden_size: usize,
        num_layers: usize,
        out_features: usize,
    ) -> Self {
        let input = LinearConfig::new(in_features, hidden_size).init(device);

        let mut hidden = Vec::new();
        for _ in 1..num_layers.max(1) {
            hidden.push(LinearConfig::new(hidden_size, hidden_size).init(device));
        }

        let output = LinearConfig::new(hidden_size, out_features).init(device);

        Self {
            input,
            hidden,
            output,
            activation: Relu::new(),
        }
    }

    /// Applies over the last axis, so any leading batch/seq shape works.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let mut x = self.activation.forward(self.input.forward(x));

        for layer in &self.hidden {
            x = self.activation.forward(layer.forward(x));
        }

        self.output.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_mlp_keeps_leading_axes() {
        let device = Default::default();
        let mlp = Mlp::<TestBackend>::new(&device, 10, 16, 3, 4);

        let out = mlp.forward(Tensor::<TestBackend, 3>::zeros([2, 5, 10], &device));
        assert_eq!(out.dims(), [2, 5, 4]);

        let out = mlp.forward(Tensor::<TestBackend, 2>::zeros([2, 10], &device));
        assert_eq!(out.dims(), [2, 4]);
    }
}
