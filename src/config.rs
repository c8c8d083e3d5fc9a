//! Model configuration and construction-time input-size resolution

use std::collections::HashSet;

use burn::config::Config;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;

use crate::error::{self, LmpError};
use crate::modality::{ModalityKind, ModalitySpec};

/// Channel count of an RGB-only encoder.
pub const RGB_CHANNELS: usize = 3;
/// Position dimensions at the start of an action
pub const POSITION_DIMS: usize = 3;
/// Orientation dimensions following the position
pub const ORIENTATION_DIMS: usize = 3;
/// Smallest action width: position, orientation and the gripper command
pub const MIN_ACTION_FEATURES: usize = POSITION_DIMS + ORIENTATION_DIMS + 1;

/// Configuration for a camera or tactile image encoder
#[derive(Debug, Config)]
pub struct VisionEncoderConfig {
    /// Declared input channels (3 for RGB)
    #[config(default = 3)]
    pub num_c: usize,
    /// Width of the embedding produced per image
    #[config(default = 64)]
    pub visual_features: usize,
    /// Channels of the first convolution
    #[config(default = 16)]
    pub hidden_channels: usize,
}

impl Default for VisionEncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth stream fused into an RGB encoder as extra channels
#[derive(Debug, Config)]
pub struct DepthConfig {
    #[config(default = 1)]
    pub num_c: usize,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Proprioceptive state filtering.
///
/// `keep_indices` is a list of half-open `[start, end)` column ranges of the
/// raw robot observation that are fed to the model.
#[derive(Debug, Config)]
pub struct ProprioStateConfig {
    pub keep_indices: Vec<[usize; 2]>,
}

impl ProprioStateConfig {
    /// Number of state dimensions retained after filtering.
    pub fn n_state_obs(&self) -> usize {
        self.keep_indices
            .iter()
            .map(|[start, end]| end.saturating_sub(*start))
            .sum()
    }

    /// Smallest raw observation width the ranges can be applied to.
    pub fn min_raw_width(&self) -> usize {
        self.keep_indices.iter().map(|[_, end]| *end).max().unwrap_or(0)
    }

    pub fn validate(&self) -> error::Result<()> {
        for [start, end] in &self.keep_indices {
            if end < start {
                return Err(LmpError::InvalidConfig(format!(
                    "keep_indices range [{start}, {end}) is reversed"
                )));
            }
        }
        Ok(())
    }

    /// Select the kept columns of one raw robot observation.
    pub fn filter(&self, raw: &[f32]) -> error::Result<Vec<f32>> {
        if raw.len() < self.min_raw_width() {
            return Err(LmpError::ShapeMismatch {
                what: "raw robot observation",
                expected: self.min_raw_width(),
                got: raw.len(),
            });
        }
        let mut out = Vec::with_capacity(self.n_state_obs());
        for [start, end] in &self.keep_indices {
            out.extend_from_slice(&raw[*start..*end]);
        }
        Ok(out)
    }
}

/// Visual goal encoder (perceptual embedding -> latent goal)
#[derive(Debug, Config)]
pub struct GoalEncoderConfig {
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl Default for GoalEncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Language goal encoder (sentence embedding -> latent goal)
#[derive(Debug, Config)]
pub struct LanguageGoalConfig {
    /// Width of the precomputed sentence embedding
    #[config(default = 384)]
    pub lang_features: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
}

impl Default for LanguageGoalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Plan proposal / recognition network
#[derive(Debug, Config)]
pub struct PlanNetworkConfig {
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    /// Lower bound on the standard deviation of the plan distribution
    #[config(default = 1e-4)]
    pub min_std: f64,
}

impl Default for PlanNetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Action decoder
#[derive(Debug, Config)]
pub struct DecoderConfig {
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    /// Action width: position (3), orientation (3), gripper (1)
    #[config(default = 7)]
    pub out_features: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Optimizer settings
#[derive(Debug, Config)]
pub struct OptimizerConfig {
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub weight_decay: f32,
    /// Gradient norm clipping threshold
    pub grad_clip: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerConfig {
    /// Build an AdamW optimizer for the given module type.
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
    ) -> impl Optimizer<M, B> + use<B, M> {
        AdamWConfig::new()
            .with_weight_decay(self.weight_decay)
            .with_grad_clipping(self.grad_clip.map(GradientClippingConfig::Norm))
            .init()
    }
}

/// Complete Play-LMP configuration
#[derive(Debug, Config)]
pub struct PlayLmpConfig {
    pub vision_static: VisionEncoderConfig,
    pub vision_gripper: Option<VisionEncoderConfig>,
    pub tactile: Option<VisionEncoderConfig>,
    pub depth_static: Option<DepthConfig>,
    pub depth_gripper: Option<DepthConfig>,
    pub proprio_state: ProprioStateConfig,
    pub visual_goal: GoalEncoderConfig,
    pub language_goal: Option<LanguageGoalConfig>,
    pub plan_proposal: PlanNetworkConfig,
    pub plan_recognition: PlanNetworkConfig,
    pub decoder: DecoderConfig,
    /// Datasets trained on jointly, each tagged with its goal modality
    pub modalities: Vec<ModalitySpec>,
    #[config(default = 32)]
    pub latent_goal_features: usize,
    #[config(default = 256)]
    pub plan_features: usize,
    /// Weight of the KL term in the training loss
    #[config(default = 1e-3)]
    pub kl_beta: f64,
    #[config(default = "OptimizerConfig::new()")]
    pub optimizer: OptimizerConfig,
}

/// Derived widths injected into every sub-network at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSizes {
    pub n_state_obs: usize,
    pub visual_features: usize,
    pub static_channels: usize,
    pub gripper_channels: Option<usize>,
    pub tactile_channels: Option<usize>,
    pub perceptual_features: usize,
    pub latent_goal_features: usize,
    pub plan_features: usize,
    pub lang_features: Option<usize>,
    pub action_features: usize,
}

/// Input channels of an encoder once an optional depth stream is fused in.
///
/// Only an encoder still declared with fewer than 4 channels gets the depth
/// channels added, so a config that already counts depth is left alone.
pub fn fused_channels(encoder: &VisionEncoderConfig, depth: Option<&DepthConfig>) -> usize {
    match depth {
        Some(depth) if encoder.num_c < 4 => encoder.num_c + depth.num_c,
        _ => encoder.num_c,
    }
}

impl PlayLmpConfig {
    /// Compute every derived input width from the base configuration.
    ///
    /// The configuration itself is never modified, so repeated calls always
    /// return the same sizes.
    pub fn resolve_input_sizes(&self) -> error::Result<InputSizes> {
        self.proprio_state.validate()?;
        self.validate_modalities()?;

        if self.latent_goal_features == 0 || self.plan_features == 0 {
            return Err(LmpError::InvalidConfig(
                "latent goal and plan widths must be non-zero".to_string(),
            ));
        }
        if self.decoder.out_features < MIN_ACTION_FEATURES {
            return Err(LmpError::InvalidConfig(format!(
                "actions need at least {} dimensions, got {}",
                MIN_ACTION_FEATURES, self.decoder.out_features
            )));
        }
        if self.depth_gripper.is_some() && self.vision_gripper.is_none() {
            return Err(LmpError::InvalidConfig(
                "depth_gripper requires vision_gripper".to_string(),
            ));
        }

        let n_state_obs = self.proprio_state.n_state_obs();

        let mut visual_features = self.vision_static.visual_features;
        if let Some(gripper) = &self.vision_gripper {
            visual_features += gripper.visual_features;
        }
        if let Some(tactile) = &self.tactile {
            visual_features += tactile.visual_features;
        }

        let static_channels = fused_channels(&self.vision_static, self.depth_static.as_ref());
        let gripper_channels = self
            .vision_gripper
            .as_ref()
            .map(|gripper| fused_channels(gripper, self.depth_gripper.as_ref()));
        let tactile_channels = self.tactile.as_ref().map(|tactile| tactile.num_c);

        Ok(InputSizes {
            n_state_obs,
            visual_features,
            static_channels,
            gripper_channels,
            tactile_channels,
            perceptual_features: visual_features + n_state_obs,
            latent_goal_features: self.latent_goal_features,
            plan_features: self.plan_features,
            lang_features: self.language_goal.as_ref().map(|lang| lang.lang_features),
            action_features: self.decoder.out_features,
        })
    }

    /// Goal modality of a configured dataset.
    pub fn modality_kind(&self, name: &str) -> error::Result<ModalityKind> {
        self.modalities
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.kind)
            .ok_or_else(|| LmpError::UnknownModality(name.to_string()))
    }

    fn validate_modalities(&self) -> error::Result<()> {
        if self.modalities.is_empty() {
            return Err(LmpError::InvalidConfig(
                "at least one modality must be configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.modalities {
            if !seen.insert(spec.name.as_str()) {
                return Err(LmpError::DuplicateModality(spec.name.clone()));
            }
            if spec.kind == ModalityKind::Language && self.language_goal.is_none() {
                return Err(LmpError::InvalidConfig(format!(
                    "modality '{}' needs a language goal encoder",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}
