#![allow(dead_code)]

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::ElementConversion;
use play_lmp::config::{
    DecoderConfig, DepthConfig, GoalEncoderConfig, LanguageGoalConfig, PlanNetworkConfig,
    ProprioStateConfig, VisionEncoderConfig,
};
use play_lmp::dataset::{PlayDataModule, PlayDataset, WindowShape};
use play_lmp::training::StepSource;
use play_lmp::{Frame, ModalityKind, ModalitySpec, PlayLmpConfig, StepBatch};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

pub const PLAN: usize = 4;
pub const GOAL: usize = 3;
pub const LANG: usize = 5;
pub const RAW_STATE: usize = 9;
pub const STATIC_HW: (usize, usize) = (16, 16);
pub const GRIPPER_HW: (usize, usize) = (8, 8);

/// Static camera with depth, gripper camera, 7 filtered state dims
pub fn config() -> PlayLmpConfig {
    PlayLmpConfig::new(
        VisionEncoderConfig::new()
            .with_visual_features(8)
            .with_hidden_channels(4),
        ProprioStateConfig::new(vec![[0, 3], [3, 6], [8, 9]]),
        GoalEncoderConfig::new().with_hidden_size(16),
        PlanNetworkConfig::new().with_hidden_size(16),
        PlanNetworkConfig::new().with_hidden_size(16),
        DecoderConfig::new().with_hidden_size(16),
        vec![ModalitySpec::vision("vis"), ModalitySpec::language("lang")],
    )
    .with_vision_gripper(Some(
        VisionEncoderConfig::new()
            .with_visual_features(6)
            .with_hidden_channels(4),
    ))
    .with_depth_static(Some(DepthConfig::new()))
    .with_language_goal(Some(
        LanguageGoalConfig::new()
            .with_lang_features(LANG)
            .with_hidden_size(16),
    ))
    .with_plan_features(PLAN)
    .with_latent_goal_features(GOAL)
}

pub fn window_shape(config: &PlayLmpConfig, kind: ModalityKind, seq_len: usize) -> WindowShape {
    WindowShape {
        seq_len,
        channels: config.vision_static.num_c,
        static_hw: STATIC_HW,
        gripper_hw: Some(GRIPPER_HW),
        static_depth: true,
        raw_state: RAW_STATE,
        action_dim: config.decoder.out_features,
        lang_features: (kind == ModalityKind::Language).then_some(LANG),
    }
}

pub fn data_module(config: &PlayLmpConfig, batch_size: usize, seed: u64) -> PlayDataModule {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = |windows: usize| -> Vec<PlayDataset> {
        config
            .modalities
            .iter()
            .map(|spec| {
                let shape = window_shape(config, spec.kind, 4);
                PlayDataset::synthetic(spec.clone(), shape, windows, &mut rng).unwrap()
            })
            .collect()
    };
    let train = split(6);
    let val = split(4);
    PlayDataModule::new(train, val, config.proprio_state.clone(), batch_size, seed).unwrap()
}

pub fn train_batch<B: Backend>(data: &mut PlayDataModule, device: &B::Device) -> StepBatch<B> {
    <PlayDataModule as StepSource<B>>::train_batch(data, device).unwrap()
}

pub fn val_batch<B: Backend>(data: &mut PlayDataModule, device: &B::Device) -> StepBatch<B> {
    <PlayDataModule as StepSource<B>>::val_batch(data, device).unwrap()
}

pub fn frame<B: Backend>(device: &B::Device) -> Frame<B> {
    use burn::tensor::Distribution;
    let (h, w) = STATIC_HW;
    let (gh, gw) = GRIPPER_HW;
    Frame {
        rgb_static: Tensor::random([3, h, w], Distribution::Default, device),
        rgb_gripper: Some(Tensor::random([3, gh, gw], Distribution::Default, device)),
        rgb_tactile: None,
        depth_static: Some(Tensor::random([h, w], Distribution::Default, device)),
        depth_gripper: None,
        robot_obs: Tensor::random([7], Distribution::Default, device),
    }
}

pub fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_scalar().elem::<f32>()
}

pub fn values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data().to_vec::<f32>().unwrap()
}

pub fn assert_close(actual: f32, expected: f32) {
    let tolerance = 1e-4 * expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected}, got {actual}"
    );
}
