//! Play-LMP: latent motor plans learned from play
//!
//! The model fuses the camera, tactile and proprioceptive streams into one
//! perceptual embedding per timestep and learns two distributions over latent
//! plans sharing one action decoder:
//!
//! - the *recognition* distribution sees the whole window (hindsight) and is
//!   only used while training,
//! - the *proposal* distribution sees the first frame and the goal, and is the
//!   one sampled at rollout time.
//!
//! Training pulls the proposal towards the recognition distribution with a KL
//! term weighted by `kl_beta`, while the decoder learns to reconstruct the
//! demonstrated actions from recognition samples.

use burn::module::Module;
use burn::prelude::*;

use crate::config::{InputSizes, PlayLmpConfig};
use crate::distribution::PlanDistribution;
use crate::error::{LmpError, Result, ensure_timesteps, ensure_width};
use crate::modality::{DepthObs, Frame, ModalityKind, RgbObs, stack_frames};
use crate::networks::{
    ActionDecoder, ActionDecoding, ImageEncoder, LanguageGoal, LanguageGoalEncoder,
    PlanProposal, PlanProposalNetwork, PlanRecognition, PlanRecognitionNetwork, VisionNetwork,
    VisualGoal, VisualGoalEncoder,
};

/// Complete Play-LMP model
#[derive(Module, Debug)]
pub struct PlayLmp<B: Backend> {
    plan_proposal: PlanProposalNetwork<B>,
    plan_recognition: PlanRecognitionNetwork<B>,
    vision_static: VisionNetwork<B>,
    vision_gripper: Option<VisionNetwork<B>>,
    tactile: Option<VisionNetwork<B>>,
    visual_goal: VisualGoalEncoder<B>,
    language_goal: Option<LanguageGoalEncoder<B>>,
    action_decoder: ActionDecoder<B>,
    n_state_obs: usize,
    visual_features: usize,
    static_channels: usize,
    gripper_channels: usize,
    tactile_channels: usize,
    action_features: usize,
    /// Weight of the KL term; changed between epochs by the trainer
    kl_beta: f64,
}

impl PlayLmpConfig {
    /// Resolve derived input sizes, then build every sub-network with them.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PlayLmp<B>> {
        let sizes = self.resolve_input_sizes()?;
        let InputSizes {
            n_state_obs,
            visual_features,
            static_channels,
            perceptual_features,
            latent_goal_features,
            plan_features,
            ..
        } = sizes;

        let vision_static = VisionNetwork::new(device, static_channels, &self.vision_static);
        let vision_gripper = self
            .vision_gripper
            .as_ref()
            .zip(sizes.gripper_channels)
            .map(|(config, channels)| VisionNetwork::new(device, channels, config));
        let tactile = self
            .tactile
            .as_ref()
            .zip(sizes.tactile_channels)
            .map(|(config, channels)| VisionNetwork::new(device, channels, config));

        let model = PlayLmp {
            plan_proposal: PlanProposalNetwork::new(
                device,
                perceptual_features,
                latent_goal_features,
                plan_features,
                &self.plan_proposal,
            ),
            plan_recognition: PlanRecognitionNetwork::new(
                device,
                perceptual_features,
                plan_features,
                &self.plan_recognition,
            ),
            vision_static,
            vision_gripper,
            tactile,
            visual_goal: VisualGoalEncoder::new(
                device,
                perceptual_features,
                latent_goal_features,
                &self.visual_goal,
            ),
            language_goal: self
                .language_goal
                .as_ref()
                .map(|config| LanguageGoalEncoder::new(device, latent_goal_features, config)),
            action_decoder: ActionDecoder::new(
                device,
                plan_features,
                perceptual_features,
                latent_goal_features,
                &self.decoder,
            ),
            n_state_obs,
            visual_features,
            static_channels,
            gripper_channels: sizes.gripper_channels.unwrap_or(0),
            tactile_channels: sizes.tactile_channels.unwrap_or(0),
            action_features: sizes.action_features,
            kl_beta: self.kl_beta,
        };

        tracing::info!(
            "Built Play-LMP: visual_features={}, n_state_obs={}, plan={}, goal={}, params={}",
            visual_features,
            n_state_obs,
            plan_features,
            latent_goal_features,
            model.num_params()
        );

        Ok(model)
    }
}

impl<B: Backend> PlayLmp<B> {
    pub fn kl_beta(&self) -> f64 {
        self.kl_beta
    }

    /// Takes effect from the next step on.
    pub fn set_kl_beta(&mut self, kl_beta: f64) {
        self.kl_beta = kl_beta;
    }

    pub fn visual_features(&self) -> usize {
        self.visual_features
    }

    pub fn n_state_obs(&self) -> usize {
        self.n_state_obs
    }

    pub fn perceptual_features(&self) -> usize {
        self.visual_features + self.n_state_obs
    }

    pub fn plan_proposal(&self) -> &PlanProposalNetwork<B> {
        &self.plan_proposal
    }

    pub fn plan_recognition(&self) -> &PlanRecognitionNetwork<B> {
        &self.plan_recognition
    }

    pub fn action_decoder(&self) -> &ActionDecoder<B> {
        &self.action_decoder
    }

    pub fn visual_goal(&self) -> &VisualGoalEncoder<B> {
        &self.visual_goal
    }

    /// Encode every image stream and concatenate along the feature axis.
    ///
    /// Output is `[batch, seq, visual_features]`. Depth maps are appended as
    /// extra input channels of the matching RGB encoder.
    pub fn visual_embedding(&self, rgb: &RgbObs<B>, depth: &DepthObs<B>) -> Result<Tensor<B, 3>> {
        ensure_timesteps("rgb_static", rgb.rgb_static.dims()[1])?;
        let mut encoded = encode_stream(
            &self.vision_static,
            rgb.rgb_static.clone(),
            depth.depth_static.clone(),
            self.static_channels,
            "static image channels",
        )?;

        if let Some(images) = &rgb.rgb_gripper {
            let encoder = self.vision_gripper.as_ref().ok_or_else(|| {
                LmpError::InvalidConfig("gripper images given without a gripper encoder".into())
            })?;
            let gripper = encode_stream(
                encoder,
                images.clone(),
                depth.depth_gripper.clone(),
                self.gripper_channels,
                "gripper image channels",
            )?;
            encoded = Tensor::cat(vec![encoded, gripper], 2);
        }

        if let Some(images) = &rgb.rgb_tactile {
            let encoder = self.tactile.as_ref().ok_or_else(|| {
                LmpError::InvalidConfig("tactile images given without a tactile encoder".into())
            })?;
            let tactile = encode_stream(
                encoder,
                images.clone(),
                None,
                self.tactile_channels,
                "tactile image channels",
            )?;
            encoded = Tensor::cat(vec![encoded, tactile], 2);
        }

        ensure_width("visual embedding", self.visual_features, encoded.dims()[2])?;
        Ok(encoded)
    }

    /// Visual embedding with the filtered robot state appended per timestep.
    pub fn perceptual_embedding(
        &self,
        visual_emb: Tensor<B, 3>,
        robot_obs: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>> {
        ensure_width("robot state", self.n_state_obs, robot_obs.dims()[2])?;
        ensure_timesteps("visual embedding", visual_emb.dims()[1])?;
        let [vb, vs, _] = visual_emb.dims();
        let [sb, ss, _] = robot_obs.dims();
        if (vb, vs) != (sb, ss) {
            return Err(LmpError::LengthMismatch {
                what: "visual embedding vs robot state timesteps",
                left: vb * vs,
                right: sb * ss,
            });
        }
        Ok(Tensor::cat(vec![visual_emb, robot_obs], 2))
    }

    /// Latent goal for a window, chosen by the dataset's goal modality.
    ///
    /// Vision goals encode the last timestep of the embedding; language goals
    /// encode the instruction embedding.
    pub fn latent_goal(
        &self,
        kind: ModalityKind,
        perceptual_emb: &Tensor<B, 3>,
        lang: Option<&Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        match kind {
            ModalityKind::Vision => {
                let [_, seq, _] = perceptual_emb.dims();
                ensure_timesteps("perceptual embedding", seq)?;
                Ok(self
                    .visual_goal
                    .encode_goal(timestep(perceptual_emb.clone(), seq - 1)))
            }
            ModalityKind::Language => {
                let encoder = self
                    .language_goal
                    .as_ref()
                    .ok_or(LmpError::InvalidConfig("no language goal encoder".into()))?;
                let lang = lang.ok_or(LmpError::MissingInput("lang"))?;
                Ok(encoder.encode_goal(lang.clone()))
            }
        }
    }

    pub fn lmp_train(
        &self,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> Result<LmpTrainOutput<B>> {
        ensure_width("actions", self.action_features, actions.dims()[2])?;
        ensure_timesteps("perceptual embedding", perceptual_emb.dims()[1])?;
        Ok(lmp_train(
            &self.plan_proposal,
            &self.plan_recognition,
            &self.action_decoder,
            self.kl_beta,
            perceptual_emb,
            latent_goal,
            actions,
        ))
    }

    pub fn lmp_val(
        &self,
        perceptual_emb: Tensor<B, 3>,
        latent_goal: Tensor<B, 2>,
        actions: Tensor<B, 3>,
    ) -> Result<LmpValOutput<B>> {
        ensure_width("actions", self.action_features, actions.dims()[2])?;
        ensure_timesteps("perceptual embedding", perceptual_emb.dims()[1])?;
        Ok(lmp_val(
            &self.plan_proposal,
            &self.plan_recognition,
            &self.action_decoder,
            self.kl_beta,
            perceptual_emb,
            latent_goal,
            actions,
        ))
    }

    /// Closed-loop action for the current frame under a fixed plan and goal.
    ///
    /// Returns `[1, action_dim]`, detached from any autodiff graph.
    pub fn predict_with_plan(
        &self,
        current: &Frame<B>,
        latent_goal: Tensor<B, 2>,
        sampled_plan: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let (rgb, depth, state) = stack_frames(&[current])?;
        let visual_emb = self.visual_embedding(&rgb, &depth)?;
        let perceptual_emb = self.perceptual_embedding(visual_emb, state)?;
        let action = self
            .action_decoder
            .act(sampled_plan.detach(), perceptual_emb, latent_goal.detach());
        Ok(action.detach())
    }

    /// Sample a plan towards a goal image. Returns `(plan, latent_goal)`.
    ///
    /// Current and goal frames are stacked as a two-step window; the goal is
    /// encoded from the second step and the proposal sees the first.
    pub fn get_pp_plan_vision(
        &self,
        current: &Frame<B>,
        goal: &Frame<B>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
        let (rgb, depth, state) = stack_frames(&[current, goal])?;
        let visual_emb = self.visual_embedding(&rgb, &depth)?;
        let perceptual_emb = self.perceptual_embedding(visual_emb, state)?;

        let latent_goal = self.latent_goal(ModalityKind::Vision, &perceptual_emb, None)?;
        let dist = self
            .plan_proposal
            .propose(timestep(perceptual_emb, 0), latent_goal.clone());
        Ok((dist.sample(), latent_goal.detach()))
    }

    /// Sample a plan towards a language instruction `[1, lang_features]`.
    /// Returns `(plan, latent_goal)`.
    pub fn get_pp_plan_lang(
        &self,
        current: &Frame<B>,
        goal_lang: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
        let (rgb, depth, state) = stack_frames(&[current])?;
        let visual_emb = self.visual_embedding(&rgb, &depth)?;
        let perceptual_emb = self.perceptual_embedding(visual_emb, state)?;

        let latent_goal =
            self.latent_goal(ModalityKind::Language, &perceptual_emb, Some(&goal_lang))?;
        let dist = self
            .plan_proposal
            .propose(timestep(perceptual_emb, 0), latent_goal.clone());
        Ok((dist.sample(), latent_goal.detach()))
    }
}

/// Flatten batch and sequence, fuse optional depth as one extra channel,
/// encode, and restore `[batch, seq, features]`.
fn encode_stream<B: Backend, E: ImageEncoder<B>>(
    encoder: &E,
    images: Tensor<B, 5>,
    depth: Option<Tensor<B, 4>>,
    expected_channels: usize,
    what: &'static str,
) -> Result<Tensor<B, 3>> {
    let [batch, seq, channels, height, width] = images.dims();
    let mut flat = images.reshape([batch * seq, channels, height, width]);

    if let Some(depth) = depth {
        let [db, ds, dh, dw] = depth.dims();
        ensure_width("depth frames", batch * seq, db * ds)?;
        ensure_width("depth height", height, dh)?;
        ensure_width("depth width", width, dw)?;
        let depth = depth.reshape([batch * seq, 1, height, width]);
        flat = Tensor::cat(vec![flat, depth], 1);
    }

    ensure_width(what, expected_channels, flat.dims()[1])?;
    let encoded = encoder.encode(flat);
    ensure_width("encoder output", encoder.output_features(), encoded.dims()[1])?;
    Ok(encoded.reshape([batch, seq, encoder.output_features()]))
}

/// Embedding of one timestep `[batch, seq, f] -> [batch, f]`
pub fn timestep<B: Backend>(perceptual_emb: Tensor<B, 3>, t: usize) -> Tensor<B, 2> {
    let [batch, _, features] = perceptual_emb.dims();
    perceptual_emb
        .slice([0..batch, t..t + 1, 0..features])
        .reshape([batch, features])
}

/// Losses and distributions of one training forward pass
#[derive(Debug, Clone)]
pub struct LmpTrainOutput<B: Backend> {
    /// Batch-mean KL(recognition || proposal), unscaled
    pub kl_loss: Tensor<B, 1>,
    /// `kl_loss * kl_beta`
    pub kl_loss_scaled: Tensor<B, 1>,
    pub action_loss: Tensor<B, 1>,
    /// `action_loss + kl_loss_scaled`
    pub total_loss: Tensor<B, 1>,
    pub proposal: PlanDistribution<B>,
    pub recognition: PlanDistribution<B>,
}

/// Outputs of one validation forward pass
#[derive(Debug, Clone)]
pub struct LmpValOutput<B: Backend> {
    pub sampled_plan_pp: Tensor<B, 2>,
    pub action_loss_pp: Tensor<B, 1>,
    pub sampled_plan_pr: Tensor<B, 2>,
    pub action_loss_pr: Tensor<B, 1>,
    /// Scaled KL, for monitoring only
    pub kl_loss: Tensor<B, 1>,
    /// Per-example mean absolute error of the continuous dims `[batch, action_dim - 1]`
    pub mae_pp: Tensor<B, 2>,
    pub mae_pr: Tensor<B, 2>,
    pub gripper_sr_pp: Tensor<B, 1>,
    pub gripper_sr_pr: Tensor<B, 1>,
}

/// Batch-mean KL(recognition || proposal)
pub fn compute_kl_loss<B: Backend>(
    recognition: &PlanDistribution<B>,
    proposal: &PlanDistribution<B>,
) -> Tensor<B, 1> {
    recognition.kl_divergence(proposal).mean()
}

/// Training pass: decode from a reparameterized recognition sample and
/// regularize the proposal towards the recognition distribution.
pub fn lmp_train<B, P, R, D>(
    proposal_net: &P,
    recognition_net: &R,
    decoder: &D,
    kl_beta: f64,
    perceptual_emb: Tensor<B, 3>,
    latent_goal: Tensor<B, 2>,
    actions: Tensor<B, 3>,
) -> LmpTrainOutput<B>
where
    B: Backend,
    P: PlanProposal<B>,
    R: PlanRecognition<B>,
    D: ActionDecoding<B>,
{
    let proposal = proposal_net.propose(timestep(perceptual_emb.clone(), 0), latent_goal.clone());
    let recognition = recognition_net.recognize(perceptual_emb.clone());

    let sampled_plan = recognition.rsample();
    let action_loss = decoder.loss(sampled_plan, perceptual_emb, latent_goal, actions);

    let kl_loss = compute_kl_loss(&recognition, &proposal);
    let kl_loss_scaled = kl_loss.clone() * kl_beta;
    let total_loss = action_loss.clone() + kl_loss_scaled.clone();

    LmpTrainOutput {
        kl_loss,
        kl_loss_scaled,
        action_loss,
        total_loss,
        proposal,
        recognition,
    }
}

/// Validation pass: decode independently from a proposal sample and a
/// recognition sample and measure both against the ground truth.
pub fn lmp_val<B, P, R, D>(
    proposal_net: &P,
    recognition_net: &R,
    decoder: &D,
    kl_beta: f64,
    perceptual_emb: Tensor<B, 3>,
    latent_goal: Tensor<B, 2>,
    actions: Tensor<B, 3>,
) -> LmpValOutput<B>
where
    B: Backend,
    P: PlanProposal<B>,
    R: PlanRecognition<B>,
    D: ActionDecoding<B>,
{
    let proposal = proposal_net.propose(timestep(perceptual_emb.clone(), 0), latent_goal.clone());
    let sampled_plan_pp = proposal.sample();
    let (action_loss_pp, sample_act_pp) = decoder.loss_and_act(
        sampled_plan_pp.clone(),
        perceptual_emb.clone(),
        latent_goal.clone(),
        actions.clone(),
    );

    let recognition = recognition_net.recognize(perceptual_emb.clone());
    let sampled_plan_pr = recognition.sample();
    let (action_loss_pr, sample_act_pr) = decoder.loss_and_act(
        sampled_plan_pr.clone(),
        perceptual_emb,
        latent_goal,
        actions.clone(),
    );

    let kl_loss = compute_kl_loss(&recognition, &proposal) * kl_beta;

    LmpValOutput {
        mae_pp: mean_abs_error(sample_act_pp.clone(), actions.clone()),
        mae_pr: mean_abs_error(sample_act_pr.clone(), actions.clone()),
        gripper_sr_pp: gripper_success_rate(sample_act_pp, actions.clone()),
        gripper_sr_pr: gripper_success_rate(sample_act_pr, actions),
        sampled_plan_pp,
        action_loss_pp,
        sampled_plan_pr,
        action_loss_pr,
        kl_loss,
    }
}

/// Time-averaged absolute error of every dim except the gripper.
///
/// `[batch, seq, n] -> [batch, n - 1]`
pub fn mean_abs_error<B: Backend>(predicted: Tensor<B, 3>, actual: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, seq, n] = actual.dims();
    let ranges = [0..batch, 0..seq, 0..n - 1];
    let diff = (predicted.slice(ranges.clone()) - actual.slice(ranges)).abs();
    diff.mean_dim(1).reshape([batch, n - 1])
}

/// Fraction of timesteps whose binarized gripper command matches the target.
///
/// Predictions above zero count as open (+1), everything else as closed (-1);
/// targets are expected to already be +1/-1.
pub fn gripper_success_rate<B: Backend>(
    predicted: Tensor<B, 3>,
    actual: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let [batch, seq, n] = actual.dims();
    let ranges = [0..batch, 0..seq, n - 1..n];
    let binarized = predicted.slice(ranges.clone()).greater_elem(0.0).float() * 2.0 - 1.0;
    binarized.equal(actual.slice(ranges)).float().mean()
}
