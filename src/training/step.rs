//! One training or validation step over every dataset of a [`StepBatch`]

use burn::prelude::*;
use burn::tensor::ElementConversion;

use crate::error::{LmpError, Result};
use crate::metrics::{MetricOptions, MetricSink};
use crate::modality::{ModalityBatch, ModalitySpec, StepBatch};
use crate::model::{LmpTrainOutput, LmpValOutput, PlayLmp};

/// Losses of one training step, averaged uniformly over modalities
#[derive(Debug, Clone)]
pub struct TrainStepOutput<B: Backend> {
    /// Optimization target
    pub total_loss: Tensor<B, 1>,
    pub action_loss: f32,
    /// Scaled KL term
    pub kl_loss: f32,
}

/// Validation outputs of one dataset for one step
#[derive(Debug, Clone)]
pub struct ModalityValOutput<B: Backend> {
    pub val: LmpValOutput<B>,
    /// Dataset indices of the evaluated windows
    pub idx: Tensor<B, 1, Int>,
}

/// Validation outputs of one step, keyed by modality name
#[derive(Debug, Clone)]
pub struct ValidationStepOutput<B: Backend> {
    entries: Vec<(String, ModalityValOutput<B>)>,
}

impl<B: Backend> ValidationStepOutput<B> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, output: ModalityValOutput<B>) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(LmpError::DuplicateModality(name));
        }
        self.entries.push((name, output));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModalityValOutput<B>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, output)| output)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModalityValOutput<B>)> {
        self.entries.iter().map(|(name, output)| (name.as_str(), output))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: Backend> Default for ValidationStepOutput<B> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

impl<B: Backend> PlayLmp<B> {
    /// Perceptual embedding and latent goal of one dataset's batch
    fn embed(
        &self,
        spec: &ModalitySpec,
        batch: &ModalityBatch<B>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 2>)> {
        let visual_emb = self.visual_embedding(&batch.rgb_obs, &batch.depth_obs)?;
        let perceptual_emb = self.perceptual_embedding(visual_emb, batch.robot_obs.clone())?;
        let latent_goal = self.latent_goal(spec.kind, &perceptual_emb, batch.lang.as_ref())?;
        Ok((perceptual_emb, latent_goal))
    }

    /// Run the training pass for each dataset and average the losses.
    ///
    /// Every dataset gets the same weight regardless of its batch size.
    pub fn training_step(
        &self,
        batch: &StepBatch<B>,
        sink: &mut dyn MetricSink,
    ) -> Result<TrainStepOutput<B>> {
        if batch.is_empty() {
            return Err(LmpError::EmptyBatch);
        }

        let mut total_loss: Option<Tensor<B, 1>> = None;
        let mut action_loss = 0.0;
        let mut kl_loss = 0.0;

        for (spec, modality) in batch.iter() {
            let (perceptual_emb, latent_goal) = self.embed(spec, modality)?;
            let output =
                self.lmp_train(perceptual_emb, latent_goal, modality.actions.clone())?;
            log_modality_losses(sink, &spec.name, self.kl_beta(), &output);

            action_loss += scalar(output.action_loss);
            kl_loss += scalar(output.kl_loss_scaled);
            total_loss = Some(match total_loss {
                Some(acc) => acc + output.total_loss,
                None => output.total_loss,
            });
        }

        let n = batch.len() as f32;
        let total_loss = total_loss.ok_or(LmpError::EmptyBatch)? / n;
        let action_loss = action_loss / n;
        let kl_loss = kl_loss / n;

        let options = MetricOptions::EPOCH_SYNCED;
        sink.log("train/kl_loss", kl_loss, options);
        sink.log("train/action_loss", action_loss, options);
        sink.log("train/total_loss", scalar(total_loss.clone()), options);

        Ok(TrainStepOutput {
            total_loss,
            action_loss,
            kl_loss,
        })
    }

    /// Run the validation pass for each dataset and keep every output for
    /// epoch-end aggregation.
    pub fn validation_step(&self, batch: &StepBatch<B>) -> Result<ValidationStepOutput<B>> {
        if batch.is_empty() {
            return Err(LmpError::EmptyBatch);
        }

        let mut output = ValidationStepOutput::new();
        for (spec, modality) in batch.iter() {
            let (perceptual_emb, latent_goal) = self.embed(spec, modality)?;
            let val = self.lmp_val(perceptual_emb, latent_goal, modality.actions.clone())?;
            output.insert(
                spec.name.clone(),
                ModalityValOutput {
                    val,
                    idx: modality.idx.clone(),
                },
            )?;
        }
        Ok(output)
    }
}

fn log_modality_losses<B: Backend>(
    sink: &mut dyn MetricSink,
    modality: &str,
    kl_beta: f64,
    output: &LmpTrainOutput<B>,
) {
    let options = MetricOptions::EPOCH_SYNCED;
    sink.log(
        &format!("train/kl_loss_{modality}"),
        scalar(output.kl_loss.clone()),
        options,
    );
    sink.log(
        &format!("train/kl_loss_scaled_{modality}"),
        scalar(output.kl_loss_scaled.clone()),
        options,
    );
    sink.log("train/kl_beta", kl_beta as f32, options);
    sink.log(
        &format!("train/action_loss_{modality}"),
        scalar(output.action_loss.clone()),
        options,
    );
    sink.log(
        &format!("train/total_loss_{modality}"),
        scalar(output.total_loss.clone()),
        options,
    );
}
