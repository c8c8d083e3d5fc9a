//! Epoch loop: optimization steps, validation, KL annealing and checkpoints

use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;

use super::kl_schedule::KlAnnealing;
use super::step::scalar;
use super::validation::{ValidationAccumulator, ValidationSummary};
use crate::config::PlayLmpConfig;
use crate::error::{LmpError, Result};
use crate::metrics::MetricSink;
use crate::modality::StepBatch;
use crate::model::PlayLmp;

/// Supplies the per-step batches of every configured dataset
pub trait StepSource<B: Backend> {
    /// Names of the datasets every batch contains, in processing order
    fn modalities(&self) -> Vec<String>;

    fn train_batch(&mut self, device: &B::Device) -> Result<StepBatch<B>>;

    fn val_batch(&mut self, device: &B::Device) -> Result<StepBatch<B>>;
}

/// Training loop settings
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub train_steps_per_epoch: usize,
    pub val_steps_per_epoch: usize,
    /// Directory for checkpoints and the saved model config
    pub checkpoint_dir: String,
    /// Save every N epochs, plus once at the end
    pub checkpoint_every: usize,
    /// Recomputes `kl_beta` at the start of each epoch when set
    pub kl_annealing: Option<KlAnnealing>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            train_steps_per_epoch: 100,
            val_steps_per_epoch: 10,
            checkpoint_dir: "checkpoints".to_string(),
            checkpoint_every: 5,
            kl_annealing: None,
        }
    }
}

/// What [`Trainer::fit`] observed
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub epochs: usize,
    pub steps: usize,
    /// Mean total loss of the last training epoch
    pub last_train_loss: f32,
    pub validation: Vec<ValidationSummary>,
    pub checkpoints: Vec<PathBuf>,
}

impl PlayLmpConfig {
    /// AdamW over every trainable parameter of the model
    pub fn configure_optimizers<B: AutodiffBackend>(
        &self,
    ) -> impl Optimizer<PlayLmp<B>, B> + use<B> {
        self.optimizer.init::<B, PlayLmp<B>>()
    }
}

pub struct Trainer<B: AutodiffBackend> {
    model: PlayLmp<B>,
    lmp_config: PlayLmpConfig,
    config: TrainConfig,
    device: B::Device,
    epoch: usize,
    step: usize,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(device: B::Device, lmp_config: PlayLmpConfig, config: TrainConfig) -> Result<Self> {
        let model = lmp_config.init::<B>(&device)?;
        Ok(Self::from_model(device, model, lmp_config, config))
    }

    pub fn from_model(
        device: B::Device,
        model: PlayLmp<B>,
        lmp_config: PlayLmpConfig,
        config: TrainConfig,
    ) -> Self {
        Self {
            model,
            lmp_config,
            config,
            device,
            epoch: 0,
            step: 0,
        }
    }

    pub fn fit<S: StepSource<B>>(
        &mut self,
        source: &mut S,
        sink: &mut dyn MetricSink,
    ) -> Result<FitSummary> {
        let modalities = source.modalities();
        if modalities.is_empty() {
            return Err(LmpError::EmptyBatch);
        }
        for name in &modalities {
            self.lmp_config.modality_kind(name)?;
        }

        std::fs::create_dir_all(&self.config.checkpoint_dir)?;
        self.lmp_config
            .save(Path::new(&self.config.checkpoint_dir).join("config.json"))?;

        tracing::info!(
            "Training on {:?} for {} epochs ({} steps each)",
            modalities,
            self.config.epochs,
            self.config.train_steps_per_epoch
        );

        let mut optimizer = self.lmp_config.configure_optimizers::<B>();
        let learning_rate = self.lmp_config.optimizer.learning_rate;
        let mut summary = FitSummary::default();

        for _ in 0..self.config.epochs {
            let epoch = self.epoch;
            if let Some(schedule) = &self.config.kl_annealing {
                let beta = schedule.beta(epoch);
                self.model.set_kl_beta(beta);
                tracing::debug!("Epoch {}: kl_beta = {:.6}", epoch, beta);
            }

            tracing::info!("Start training epoch {}", epoch);
            let mut epoch_loss = 0.0;
            for _ in 0..self.config.train_steps_per_epoch {
                sink.set_step(self.step);
                let batch = source.train_batch(&self.device)?;
                check_modality_kinds(&self.lmp_config, &batch)?;
                let output = self.model.training_step(&batch, sink)?;
                epoch_loss += scalar(output.total_loss.clone());

                let grads = output.total_loss.backward();
                let grads = GradientsParams::from_grads(grads, &self.model);
                self.model = optimizer.step(learning_rate, self.model.clone(), grads);
                self.step += 1;
            }
            if self.config.train_steps_per_epoch > 0 {
                summary.last_train_loss = epoch_loss / self.config.train_steps_per_epoch as f32;
            }
            tracing::info!(
                "Finished training epoch {}: avg_total_loss = {:.4}",
                epoch,
                summary.last_train_loss
            );

            if self.config.val_steps_per_epoch > 0 {
                let validation = self.validate(source, &modalities, sink)?;
                summary.validation.push(validation);
            }
            sink.end_epoch(epoch);

            self.epoch += 1;
            if self.config.checkpoint_every > 0 && self.epoch % self.config.checkpoint_every == 0 {
                summary
                    .checkpoints
                    .push(self.save_checkpoint(&format!("checkpoint_{}", epoch))?);
            }
        }

        summary.checkpoints.push(self.save_checkpoint("final")?);
        summary.epochs = self.config.epochs;
        summary.steps = self.step;
        tracing::info!("Training complete after {} steps", self.step);
        Ok(summary)
    }

    fn validate<S: StepSource<B>>(
        &self,
        source: &mut S,
        modalities: &[String],
        sink: &mut dyn MetricSink,
    ) -> Result<ValidationSummary> {
        tracing::info!("Start validation epoch {}", self.epoch);
        let model = self.model.valid();
        let mut accumulator = ValidationAccumulator::new();
        for _ in 0..self.config.val_steps_per_epoch {
            let batch = source.val_batch(&self.device)?;
            check_modality_kinds(&self.lmp_config, &batch)?;
            let batch = batch.inner();
            accumulator.push(model.validation_step(&batch)?);
        }
        let summary = accumulator.finish(modalities, sink)?;
        tracing::info!(
            "Finished validation epoch {}: action_loss_pp = {:.4}, grip_sr_pp = {:.3}",
            self.epoch,
            summary.global.act_loss_pp,
            summary.global.grip_sr_pp
        );
        Ok(summary)
    }

    /// Save the model record under the checkpoint directory.
    pub fn save_checkpoint(&self, name: &str) -> Result<PathBuf> {
        let path = Path::new(&self.config.checkpoint_dir).join(name);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model
            .clone()
            .save_file(path.clone(), &recorder)
            .map_err(|e| LmpError::Checkpoint(e.to_string()))?;
        tracing::info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.model = self
            .model
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| LmpError::Checkpoint(e.to_string()))?;
        tracing::info!("Loaded checkpoint from {}", path.display());
        Ok(())
    }

    pub fn model(&self) -> &PlayLmp<B> {
        &self.model
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

/// Every dataset in a batch must carry the goal modality it was configured with.
fn check_modality_kinds<B: Backend>(config: &PlayLmpConfig, batch: &StepBatch<B>) -> Result<()> {
    for (spec, _) in batch.iter() {
        let configured = config.modality_kind(&spec.name)?;
        if configured != spec.kind {
            return Err(LmpError::ModalityKindMismatch {
                name: spec.name.clone(),
                configured,
                got: spec.kind,
            });
        }
    }
    Ok(())
}
