//! Closed-loop control with a trained model
//!
//! A plan is sampled from the proposal network once per goal and kept for
//! `replan_every` control steps; every step decodes one action from the
//! current frame under that plan.

use std::path::Path;

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::error::{LmpError, Result};
use crate::modality::Frame;
use crate::model::PlayLmp;

/// Rollout settings
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Resample the plan after this many steps; 0 keeps the first plan
    pub replan_every: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self { replan_every: 16 }
    }
}

#[derive(Debug, Clone)]
enum Goal<B: Backend> {
    Vision(Frame<B>),
    Language(Tensor<B, 2>),
}

/// Plan and goal currently being executed
#[derive(Debug, Clone)]
struct ActivePlan<B: Backend> {
    goal: Goal<B>,
    plan: Tensor<B, 2>,
    latent_goal: Tensor<B, 2>,
    steps: usize,
}

pub struct RolloutPolicy<B: Backend> {
    model: PlayLmp<B>,
    config: RolloutConfig,
    device: B::Device,
    active: Option<ActivePlan<B>>,
}

impl<B: Backend> RolloutPolicy<B> {
    pub fn new(model: PlayLmp<B>, config: RolloutConfig, device: B::Device) -> Self {
        Self {
            model,
            config,
            device,
            active: None,
        }
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| LmpError::Checkpoint(e.to_string()))?;
        tracing::info!("Loaded model from {}", path.display());
        Ok(())
    }

    pub fn model(&self) -> &PlayLmp<B> {
        &self.model
    }

    /// Start a new task towards a goal image.
    pub fn reset_with_vision_goal(&mut self, current: &Frame<B>, goal: Frame<B>) -> Result<()> {
        let (plan, latent_goal) = self.model.get_pp_plan_vision(current, &goal)?;
        self.active = Some(ActivePlan {
            goal: Goal::Vision(goal),
            plan,
            latent_goal,
            steps: 0,
        });
        Ok(())
    }

    /// Start a new task towards a language instruction `[1, lang_features]`.
    pub fn reset_with_lang_goal(&mut self, current: &Frame<B>, lang: Tensor<B, 2>) -> Result<()> {
        let (plan, latent_goal) = self.model.get_pp_plan_lang(current, lang.clone())?;
        self.active = Some(ActivePlan {
            goal: Goal::Language(lang),
            plan,
            latent_goal,
            steps: 0,
        });
        Ok(())
    }

    /// Action `[1, action_dim]` for the current frame.
    pub fn step(&mut self, current: &Frame<B>) -> Result<Tensor<B, 2>> {
        let replan_every = self.config.replan_every;
        let active = self
            .active
            .as_mut()
            .ok_or(LmpError::MissingInput("goal; call a reset method first"))?;

        if replan_every > 0 && active.steps > 0 && active.steps % replan_every == 0 {
            let (plan, latent_goal) = match &active.goal {
                Goal::Vision(goal) => self.model.get_pp_plan_vision(current, goal)?,
                Goal::Language(lang) => self.model.get_pp_plan_lang(current, lang.clone())?,
            };
            tracing::debug!("Replanned after {} steps", active.steps);
            active.plan = plan;
            active.latent_goal = latent_goal;
        }

        let action = self.model.predict_with_plan(
            current,
            active.latent_goal.clone(),
            active.plan.clone(),
        )?;
        active.steps += 1;
        Ok(action)
    }

    /// Plan currently being followed
    pub fn plan(&self) -> Option<&Tensor<B, 2>> {
        self.active.as_ref().map(|active| &active.plan)
    }

    pub fn steps(&self) -> usize {
        self.active.as_ref().map_or(0, |active| active.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DecoderConfig, GoalEncoderConfig, LanguageGoalConfig, PlanNetworkConfig, PlayLmpConfig,
        ProprioStateConfig, VisionEncoderConfig,
    };
    use crate::modality::ModalitySpec;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn policy(replan_every: usize) -> RolloutPolicy<TestBackend> {
        let device = Default::default();
        let config = PlayLmpConfig::new(
            VisionEncoderConfig::new()
                .with_visual_features(8)
                .with_hidden_channels(4),
            ProprioStateConfig::new(vec![[0, 7]]),
            GoalEncoderConfig::new().with_hidden_size(8),
            PlanNetworkConfig::new().with_hidden_size(8),
            PlanNetworkConfig::new().with_hidden_size(8),
            DecoderConfig::new().with_hidden_size(8),
            vec![ModalitySpec::vision("vis"), ModalitySpec::language("lang")],
        )
        .with_language_goal(Some(LanguageGoalConfig::new().with_lang_features(4)))
        .with_plan_features(4)
        .with_latent_goal_features(3);
        let model = config.init::<TestBackend>(&device).unwrap();
        RolloutPolicy::new(model, RolloutConfig { replan_every }, device)
    }

    fn frame() -> Frame<TestBackend> {
        let device = Default::default();
        Frame {
            rgb_static: Tensor::random([3, 8, 8], Distribution::Default, &device),
            rgb_gripper: None,
            rgb_tactile: None,
            depth_static: None,
            depth_gripper: None,
            robot_obs: Tensor::random([7], Distribution::Default, &device),
        }
    }

    fn plan_values(policy: &RolloutPolicy<TestBackend>) -> Vec<f32> {
        policy.plan().unwrap().clone().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_step_requires_goal() {
        let mut policy = policy(4);
        assert!(policy.step(&frame()).is_err());
    }

    #[test]
    fn test_plan_kept_until_replan() {
        let mut policy = policy(3);
        let current = frame();
        policy.reset_with_vision_goal(&current, frame()).unwrap();
        let first = plan_values(&policy);

        for _ in 0..3 {
            let action = policy.step(&current).unwrap();
            assert_eq!(action.dims(), [1, 7]);
        }
        assert_eq!(plan_values(&policy), first);
        assert_eq!(policy.steps(), 3);

        policy.step(&current).unwrap();
        assert_eq!(policy.steps(), 4);
    }

    #[test]
    fn test_language_goal_rollout() {
        let device = Default::default();
        let mut policy = policy(0);
        let current = frame();
        policy
            .reset_with_lang_goal(&current, Tensor::zeros([1, 4], &device))
            .unwrap();
        for _ in 0..5 {
            policy.step(&current).unwrap();
        }
        assert_eq!(policy.plan().unwrap().dims(), [1, 4]);
    }
}
