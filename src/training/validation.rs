//! Epoch-end aggregation of validation outputs

use burn::prelude::*;

use super::step::{ValidationStepOutput, scalar};
use crate::config::{ORIENTATION_DIMS, POSITION_DIMS};
use crate::error::{LmpError, Result};
use crate::metrics::{MetricOptions, MetricSink};
use crate::model::LmpValOutput;

/// Epoch-level validation metrics for one dataset, or their mean over
/// datasets
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationMetrics {
    pub act_loss_pp: f32,
    pub act_loss_pr: f32,
    pub kl_loss: f32,
    pub total_mae_pp: f32,
    pub total_mae_pr: f32,
    pub pos_mae_pp: f32,
    pub pos_mae_pr: f32,
    pub orn_mae_pp: f32,
    pub orn_mae_pr: f32,
    pub grip_sr_pp: f32,
    pub grip_sr_pr: f32,
}

impl ValidationMetrics {
    fn add(&mut self, other: &Self) {
        self.act_loss_pp += other.act_loss_pp;
        self.act_loss_pr += other.act_loss_pr;
        self.kl_loss += other.kl_loss;
        self.total_mae_pp += other.total_mae_pp;
        self.total_mae_pr += other.total_mae_pr;
        self.pos_mae_pp += other.pos_mae_pp;
        self.pos_mae_pr += other.pos_mae_pr;
        self.orn_mae_pp += other.orn_mae_pp;
        self.orn_mae_pr += other.orn_mae_pr;
        self.grip_sr_pp += other.grip_sr_pp;
        self.grip_sr_pr += other.grip_sr_pr;
    }

    fn scale(&mut self, factor: f32) {
        self.act_loss_pp *= factor;
        self.act_loss_pr *= factor;
        self.kl_loss *= factor;
        self.total_mae_pp *= factor;
        self.total_mae_pr *= factor;
        self.pos_mae_pp *= factor;
        self.pos_mae_pr *= factor;
        self.orn_mae_pp *= factor;
        self.orn_mae_pr *= factor;
        self.grip_sr_pp *= factor;
        self.grip_sr_pr *= factor;
    }
}

/// Result of one validation epoch
#[derive(Debug, Clone, Default)]
pub struct ValidationSummary {
    pub per_modality: Vec<(String, ValidationMetrics)>,
    /// Unweighted mean over datasets
    pub global: ValidationMetrics,
}

impl ValidationSummary {
    pub fn modality(&self, name: &str) -> Option<&ValidationMetrics> {
        self.per_modality
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, metrics)| metrics)
    }
}

/// Collects validation step outputs over an epoch
#[derive(Debug)]
pub struct ValidationAccumulator<B: Backend> {
    outputs: Vec<ValidationStepOutput<B>>,
}

impl<B: Backend> ValidationAccumulator<B> {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
        }
    }

    pub fn push(&mut self, output: ValidationStepOutput<B>) {
        self.outputs.push(output);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn outputs(&self) -> &[ValidationStepOutput<B>] {
        &self.outputs
    }

    /// Aggregate and log the epoch, then clear the stored outputs.
    pub fn finish(
        &mut self,
        modalities: &[String],
        sink: &mut dyn MetricSink,
    ) -> Result<ValidationSummary> {
        let summary = validation_epoch_end(&self.outputs, modalities, sink)?;
        self.outputs.clear();
        Ok(summary)
    }
}

impl<B: Backend> Default for ValidationAccumulator<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce every step's outputs per dataset, then average over datasets.
///
/// Losses, KL and gripper success rates are means of the per-step values.
/// MAE values are concatenated over all validated windows before averaging.
pub fn validation_epoch_end<B: Backend>(
    outputs: &[ValidationStepOutput<B>],
    modalities: &[String],
    sink: &mut dyn MetricSink,
) -> Result<ValidationSummary> {
    if modalities.is_empty() {
        return Err(LmpError::EmptyBatch);
    }

    let options = MetricOptions::EPOCH_SYNCED;
    let mut summary = ValidationSummary::default();

    for modality in modalities {
        let metrics = modality_metrics(outputs, modality)?;
        log_modality(sink, modality, &metrics, options);
        summary.global.add(&metrics);
        summary.per_modality.push((modality.clone(), metrics));
    }
    summary.global.scale(1.0 / modalities.len() as f32);

    let global = &summary.global;
    sink.log("val_act/action_loss_pp", global.act_loss_pp, options);
    sink.log("val_act/action_loss_pr", global.act_loss_pr, options);
    sink.log("val_kl/kl_loss", global.kl_loss, options);
    sink.log("val_total_mae/total_mae_pr", global.total_mae_pr, options);
    sink.log("val_total_mae/total_mae_pp", global.total_mae_pp, options);
    sink.log("val_pos_mae/pos_mae_pr", global.pos_mae_pr, options);
    sink.log("val_pos_mae/pos_mae_pp", global.pos_mae_pp, options);
    sink.log("val_orn_mae/orn_mae_pr", global.orn_mae_pr, options);
    sink.log("val_orn_mae/orn_mae_pp", global.orn_mae_pp, options);
    sink.log("val_grip/grip_sr_pr", global.grip_sr_pr, options);
    sink.log("val_grip/grip_sr_pp", global.grip_sr_pp, options);

    Ok(summary)
}

fn modality_metrics<B: Backend>(
    outputs: &[ValidationStepOutput<B>],
    modality: &str,
) -> Result<ValidationMetrics> {
    let steps = outputs
        .iter()
        .map(|output| output.get(modality).map(|entry| &entry.val))
        .collect::<Option<Vec<_>>>()
        .filter(|steps| !steps.is_empty())
        .ok_or_else(|| LmpError::MissingValidationOutputs(modality.to_string()))?;

    let mae_pp = Tensor::cat(steps.iter().map(|val| val.mae_pp.clone()).collect(), 0);
    let mae_pr = Tensor::cat(steps.iter().map(|val| val.mae_pr.clone()).collect(), 0);

    let (total_mae_pp, pos_mae_pp, orn_mae_pp) = split_mae(mae_pp)?;
    let (total_mae_pr, pos_mae_pr, orn_mae_pr) = split_mae(mae_pr)?;

    Ok(ValidationMetrics {
        act_loss_pp: step_mean(&steps, |val| val.action_loss_pp.clone()),
        act_loss_pr: step_mean(&steps, |val| val.action_loss_pr.clone()),
        kl_loss: step_mean(&steps, |val| val.kl_loss.clone()),
        total_mae_pp,
        total_mae_pr,
        pos_mae_pp,
        pos_mae_pr,
        orn_mae_pp,
        orn_mae_pr,
        grip_sr_pp: step_mean(&steps, |val| val.gripper_sr_pp.clone()),
        grip_sr_pr: step_mean(&steps, |val| val.gripper_sr_pr.clone()),
    })
}

/// Mean over steps of a per-step scalar
fn step_mean<B: Backend>(
    steps: &[&LmpValOutput<B>],
    select: impl Fn(&LmpValOutput<B>) -> Tensor<B, 1>,
) -> f32 {
    let values: Vec<Tensor<B, 1>> = steps.iter().map(|val| select(*val)).collect();
    scalar(Tensor::cat(values, 0).mean())
}

/// `(total, position, orientation)` means of a `[windows, dims]` MAE tensor
fn split_mae<B: Backend>(mae: Tensor<B, 2>) -> Result<(f32, f32, f32)> {
    let [rows, dims] = mae.dims();
    let needed = POSITION_DIMS + ORIENTATION_DIMS;
    if dims < needed {
        return Err(LmpError::ShapeMismatch {
            what: "validation MAE width",
            expected: needed,
            got: dims,
        });
    }

    let total = scalar(mae.clone().mean());
    let pos = scalar(mae.clone().slice([0..rows, 0..POSITION_DIMS]).mean());
    let orn = scalar(mae.slice([0..rows, POSITION_DIMS..needed]).mean());
    Ok((total, pos, orn))
}

fn log_modality(
    sink: &mut dyn MetricSink,
    modality: &str,
    metrics: &ValidationMetrics,
    options: MetricOptions,
) {
    let entries = [
        (format!("val_act/{modality}_act_loss_pp"), metrics.act_loss_pp),
        (format!("val_act/{modality}_act_loss_pr"), metrics.act_loss_pr),
        (format!("val_total_mae/{modality}_total_mae_pr"), metrics.total_mae_pr),
        (format!("val_total_mae/{modality}_total_mae_pp"), metrics.total_mae_pp),
        (format!("val_pos_mae/{modality}_pos_mae_pr"), metrics.pos_mae_pr),
        (format!("val_pos_mae/{modality}_pos_mae_pp"), metrics.pos_mae_pp),
        (format!("val_orn_mae/{modality}_orn_mae_pr"), metrics.orn_mae_pr),
        (format!("val_orn_mae/{modality}_orn_mae_pp"), metrics.orn_mae_pp),
        (format!("val_grip/{modality}_grip_sr_pr"), metrics.grip_sr_pr),
        (format!("val_grip/{modality}_grip_sr_pp"), metrics.grip_sr_pp),
        (format!("val_kl/{modality}_kl_loss"), metrics.kl_loss),
    ];
    for (name, value) in entries {
        sink.log(&name, value, options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;
    use crate::training::step::ModalityValOutput;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    /// Every metric of the output is `value`; MAE rows are `value` as well.
    fn constant_output(value: f32, windows: usize) -> ModalityValOutput<TestBackend> {
        let device = Default::default();
        let s = || Tensor::<TestBackend, 1>::from_floats([value], &device);
        let mae = || Tensor::<TestBackend, 2>::ones([windows, 6], &device) * value;
        ModalityValOutput {
            val: LmpValOutput {
                sampled_plan_pp: Tensor::zeros([windows, 4], &device),
                action_loss_pp: s(),
                sampled_plan_pr: Tensor::zeros([windows, 4], &device),
                action_loss_pr: s(),
                kl_loss: s(),
                mae_pp: mae(),
                mae_pr: mae(),
                gripper_sr_pp: s(),
                gripper_sr_pr: s(),
            },
            idx: Tensor::zeros([windows], &device),
        }
    }

    fn step(vis: f32, lang: f32) -> ValidationStepOutput<TestBackend> {
        let mut output = ValidationStepOutput::new();
        output.insert("vis", constant_output(vis, 2)).unwrap();
        output.insert("lang", constant_output(lang, 2)).unwrap();
        output
    }

    #[test]
    fn test_aggregate_is_mean_of_modality_means() {
        let outputs = vec![step(1.0, 10.0), step(3.0, 20.0)];
        let modalities = vec!["vis".to_string(), "lang".to_string()];
        let mut sink = MemorySink::new();

        let summary = validation_epoch_end(&outputs, &modalities, &mut sink).unwrap();

        let vis = summary.modality("vis").unwrap();
        assert!((vis.act_loss_pp - 2.0).abs() < 1e-5);
        assert!((vis.pos_mae_pr - 2.0).abs() < 1e-5);
        let lang = summary.modality("lang").unwrap();
        assert!((lang.grip_sr_pp - 15.0).abs() < 1e-5);

        // (2 + 15) / 2
        assert!((summary.global.act_loss_pr - 8.5).abs() < 1e-5);
        assert!((summary.global.kl_loss - 8.5).abs() < 1e-5);
        assert!((summary.global.orn_mae_pp - 8.5).abs() < 1e-5);
        assert!((sink.last("val_act/action_loss_pp").unwrap() - 8.5).abs() < 1e-5);
        assert!((sink.last("val_kl/vis_kl_loss").unwrap() - 2.0).abs() < 1e-5);
        assert!((sink.last("val_grip/lang_grip_sr_pr").unwrap() - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_mae_is_weighted_by_windows() {
        let mut first = ValidationStepOutput::new();
        first.insert("vis", constant_output(1.0, 1)).unwrap();
        let mut second = ValidationStepOutput::new();
        second.insert("vis", constant_output(4.0, 3)).unwrap();

        let mut sink = MemorySink::new();
        let summary =
            validation_epoch_end(&[first, second], &["vis".to_string()], &mut sink).unwrap();

        // Step losses average per step, MAE averages per window
        assert!((summary.global.act_loss_pp - 2.5).abs() < 1e-5);
        assert!((summary.global.total_mae_pp - 3.25).abs() < 1e-5);
    }

    #[test]
    fn test_missing_modality_is_error() {
        let outputs = vec![step(1.0, 2.0)];
        let mut sink = MemorySink::new();
        let result = validation_epoch_end(&outputs, &["other".to_string()], &mut sink);
        assert!(matches!(result, Err(LmpError::MissingValidationOutputs(_))));

        let empty: Vec<ValidationStepOutput<TestBackend>> = Vec::new();
        let result = validation_epoch_end(&empty, &["vis".to_string()], &mut sink);
        assert!(matches!(result, Err(LmpError::MissingValidationOutputs(_))));
    }

    #[test]
    fn test_accumulator_clears_after_finish() {
        let mut acc = ValidationAccumulator::new();
        acc.push(step(1.0, 1.0));
        assert_eq!(acc.len(), 1);
        let mut sink = MemorySink::new();
        acc.finish(&["vis".to_string(), "lang".to_string()], &mut sink)
            .unwrap();
        assert!(acc.is_empty());
    }
}
