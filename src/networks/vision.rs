//! Convolutional image encoder used for static, gripper and tactile streams

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

use super::ImageEncoder;
use crate::config::VisionEncoderConfig;

/// Two strided convolutions, global average pooling and a linear projection
#[derive(Module, Debug)]
pub struct VisionNetwork<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    projection: Linear<B>,
    activation: Relu,
    visual_features: usize,
}

impl<B: Backend> VisionNetwork<B> {
    /// `in_channels` is the fused channel count (RGB plus any depth).
    pub fn new(device: &B::Device, in_channels: usize, config: &VisionEncoderConfig) -> Self {
        let hidden = config.hidden_channels;
        let conv1 = Conv2dConfig::new([in_channels, hidden], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv2 = Conv2dConfig::new([hidden, hidden * 2], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Self {
            conv1,
            conv2,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            projection: LinearConfig::new(hidden * 2, config.visual_features).init(device),
            activation: Relu::new(),
            visual_features: config.visual_features,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.activation.forward(self.conv2.forward(x));
        let [n, c, _, _] = x.dims();
        let x = self.pool.forward(x).reshape([n, c]);
        self.projection.forward(x)
    }
}

impl<B: Backend> ImageEncoder<B> for VisionNetwork<B> {
    fn output_features(&self) -> usize {
        self.visual_features
    }

    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}
