//! Dataset modalities and the per-step batches they produce

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::{LmpError, Result};

/// Which goal encoder a dataset's examples are conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModalityKind {
    /// Goal is the last frame of the window, encoded by the visual goal encoder
    Vision,
    /// Goal is a language instruction, encoded by the language goal encoder
    Language,
}

/// A configured dataset and its goal modality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalitySpec {
    pub name: String,
    pub kind: ModalityKind,
}

impl ModalitySpec {
    pub fn new(name: impl Into<String>, kind: ModalityKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn vision(name: impl Into<String>) -> Self {
        Self::new(name, ModalityKind::Vision)
    }

    pub fn language(name: impl Into<String>) -> Self {
        Self::new(name, ModalityKind::Language)
    }
}

/// Camera and tactile images, each `[batch, seq, channels, height, width]`
#[derive(Debug, Clone)]
pub struct RgbObs<B: Backend> {
    pub rgb_static: Tensor<B, 5>,
    pub rgb_gripper: Option<Tensor<B, 5>>,
    pub rgb_tactile: Option<Tensor<B, 5>>,
}

impl<B: Backend> RgbObs<B> {
    pub fn new(rgb_static: Tensor<B, 5>) -> Self {
        Self {
            rgb_static,
            rgb_gripper: None,
            rgb_tactile: None,
        }
    }

    pub fn with_gripper(mut self, rgb_gripper: Tensor<B, 5>) -> Self {
        self.rgb_gripper = Some(rgb_gripper);
        self
    }

    pub fn with_tactile(mut self, rgb_tactile: Tensor<B, 5>) -> Self {
        self.rgb_tactile = Some(rgb_tactile);
        self
    }
}

/// Depth maps, each `[batch, seq, height, width]`
#[derive(Debug, Clone)]
pub struct DepthObs<B: Backend> {
    pub depth_static: Option<Tensor<B, 4>>,
    pub depth_gripper: Option<Tensor<B, 4>>,
}

impl<B: Backend> DepthObs<B> {
    pub fn none() -> Self {
        Self {
            depth_static: None,
            depth_gripper: None,
        }
    }
}

impl<B: Backend> Default for DepthObs<B> {
    fn default() -> Self {
        Self::none()
    }
}

/// One dataset's synchronized tensors for a single step
#[derive(Debug, Clone)]
pub struct ModalityBatch<B: Backend> {
    pub rgb_obs: RgbObs<B>,
    pub depth_obs: DepthObs<B>,
    /// Filtered proprioceptive state `[batch, seq, n_state_obs]`
    pub robot_obs: Tensor<B, 3>,
    /// Ground-truth actions `[batch, seq, action_dim]`
    pub actions: Tensor<B, 3>,
    /// Sentence embedding `[batch, lang_features]`
    pub lang: Option<Tensor<B, 2>>,
    /// Dataset indices of the windows in this batch
    pub idx: Tensor<B, 1, Int>,
}

impl<B: Backend> ModalityBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.actions.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.actions.dims()[1]
    }
}

impl<B: AutodiffBackend> ModalityBatch<B> {
    /// Same batch on the inner (non-autodiff) backend, for validation.
    pub fn inner(&self) -> ModalityBatch<B::InnerBackend> {
        ModalityBatch {
            rgb_obs: RgbObs {
                rgb_static: self.rgb_obs.rgb_static.clone().inner(),
                rgb_gripper: self.rgb_obs.rgb_gripper.clone().map(|t| t.inner()),
                rgb_tactile: self.rgb_obs.rgb_tactile.clone().map(|t| t.inner()),
            },
            depth_obs: DepthObs {
                depth_static: self.depth_obs.depth_static.clone().map(|t| t.inner()),
                depth_gripper: self.depth_obs.depth_gripper.clone().map(|t| t.inner()),
            },
            robot_obs: self.robot_obs.clone().inner(),
            actions: self.actions.clone().inner(),
            lang: self.lang.clone().map(|t| t.inner()),
            idx: self.idx.clone().inner(),
        }
    }
}

/// All datasets' batches for one training or validation step.
///
/// Each entry is tagged with the [`ModalitySpec`] of the dataset it came from.
/// Names are unique; insertion order is the order modalities are processed in.
#[derive(Debug, Clone)]
pub struct StepBatch<B: Backend> {
    entries: Vec<(ModalitySpec, ModalityBatch<B>)>,
}

impl<B: Backend> StepBatch<B> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, spec: ModalitySpec, batch: ModalityBatch<B>) -> Result<()> {
        if self.entries.iter().any(|(existing, _)| existing.name == spec.name) {
            return Err(LmpError::DuplicateModality(spec.name));
        }
        self.entries.push((spec, batch));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModalityBatch<B>> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, batch)| batch)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModalitySpec, &ModalityBatch<B>)> {
        self.entries.iter().map(|(spec, batch)| (spec, batch))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: AutodiffBackend> StepBatch<B> {
    pub fn inner(&self) -> StepBatch<B::InnerBackend> {
        StepBatch {
            entries: self
                .entries
                .iter()
                .map(|(spec, batch)| (spec.clone(), batch.inner()))
                .collect(),
        }
    }
}

impl<B: Backend> Default for StepBatch<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single observation frame used at rollout time (no batch or seq axis)
#[derive(Debug, Clone)]
pub struct Frame<B: Backend> {
    /// `[channels, height, width]`
    pub rgb_static: Tensor<B, 3>,
    pub rgb_gripper: Option<Tensor<B, 3>>,
    pub rgb_tactile: Option<Tensor<B, 3>>,
    /// `[height, width]`
    pub depth_static: Option<Tensor<B, 2>>,
    pub depth_gripper: Option<Tensor<B, 2>>,
    /// Filtered proprioceptive state `[n_state_obs]`
    pub robot_obs: Tensor<B, 1>,
}

/// Stack frames along a new sequence axis into a batch of one window.
///
/// Every frame must carry the same set of optional streams.
pub fn stack_frames<B: Backend>(
    frames: &[&Frame<B>],
) -> Result<(RgbObs<B>, DepthObs<B>, Tensor<B, 3>)> {
    let first = frames.first().ok_or(LmpError::EmptyBatch)?;

    let rgb_static = stack_images(frames.iter().map(|f| Some(f.rgb_static.clone())), "rgb_static")?
        .ok_or(LmpError::MissingInput("rgb_static"))?;
    let rgb_gripper = stack_images(frames.iter().map(|f| f.rgb_gripper.clone()), "rgb_gripper")?;
    let rgb_tactile = stack_images(frames.iter().map(|f| f.rgb_tactile.clone()), "rgb_tactile")?;
    let depth_static =
        stack_depths(frames.iter().map(|f| f.depth_static.clone()), "depth_static")?;
    let depth_gripper =
        stack_depths(frames.iter().map(|f| f.depth_gripper.clone()), "depth_gripper")?;

    let states: Vec<Tensor<B, 2>> = frames
        .iter()
        .map(|f| f.robot_obs.clone().unsqueeze_dim::<2>(0))
        .collect();
    let state_dim = first.robot_obs.dims()[0];
    let robot_obs = Tensor::cat(states, 0).reshape([1, frames.len(), state_dim]);

    let rgb_obs = RgbObs {
        rgb_static,
        rgb_gripper,
        rgb_tactile,
    };
    let depth_obs = DepthObs {
        depth_static,
        depth_gripper,
    };
    Ok((rgb_obs, depth_obs, robot_obs))
}

fn stack_images<B: Backend>(
    images: impl Iterator<Item = Option<Tensor<B, 3>>>,
    what: &'static str,
) -> Result<Option<Tensor<B, 5>>> {
    let (present, total) = collect_present(images);
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != total {
        return Err(LmpError::LengthMismatch {
            what,
            left: present.len(),
            right: total,
        });
    }
    let seq: Vec<Tensor<B, 4>> = present.into_iter().map(|t| t.unsqueeze_dim::<4>(0)).collect();
    Ok(Some(Tensor::cat(seq, 0).unsqueeze_dim::<5>(0)))
}

fn stack_depths<B: Backend>(
    depths: impl Iterator<Item = Option<Tensor<B, 2>>>,
    what: &'static str,
) -> Result<Option<Tensor<B, 4>>> {
    let (present, total) = collect_present(depths);
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != total {
        return Err(LmpError::LengthMismatch {
            what,
            left: present.len(),
            right: total,
        });
    }
    let seq: Vec<Tensor<B, 3>> = present.into_iter().map(|t| t.unsqueeze_dim::<3>(0)).collect();
    Ok(Some(Tensor::cat(seq, 0).unsqueeze_dim::<4>(0)))
}

fn collect_present<T>(items: impl Iterator<Item = Option<T>>) -> (Vec<T>, usize) {
    let mut total = 0;
    let mut present = Vec::new();
    for item in items {
        total += 1;
        if let Some(item) = item {
            present.push(item);
        }
    }
    (present, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn frame(with_gripper: bool) -> Frame<TestBackend> {
        let device = Default::default();
        Frame {
            rgb_static: Tensor::zeros([3, 8, 8], &device),
            rgb_gripper: with_gripper.then(|| Tensor::zeros([3, 4, 4], &device)),
            rgb_tactile: None,
            depth_static: Some(Tensor::zeros([8, 8], &device)),
            depth_gripper: None,
            robot_obs: Tensor::zeros([7], &device),
        }
    }

    #[test]
    fn test_stack_frames_adds_batch_and_seq_axes() {
        let current = frame(true);
        let goal = frame(true);
        let (rgb, depth, state) = stack_frames(&[&current, &goal]).unwrap();

        assert_eq!(rgb.rgb_static.dims(), [1, 2, 3, 8, 8]);
        assert_eq!(rgb.rgb_gripper.unwrap().dims(), [1, 2, 3, 4, 4]);
        assert!(rgb.rgb_tactile.is_none());
        assert_eq!(depth.depth_static.unwrap().dims(), [1, 2, 8, 8]);
        assert!(depth.depth_gripper.is_none());
        assert_eq!(state.dims(), [1, 2, 7]);
    }

    #[test]
    fn test_stack_frames_rejects_mismatched_streams() {
        let current = frame(true);
        let goal = frame(false);
        assert!(matches!(
            stack_frames(&[&current, &goal]),
            Err(LmpError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_step_batch_rejects_duplicates() {
        let device = Default::default();
        let batch = ModalityBatch::<TestBackend> {
            rgb_obs: RgbObs::new(Tensor::zeros([1, 2, 3, 8, 8], &device)),
            depth_obs: DepthObs::none(),
            robot_obs: Tensor::zeros([1, 2, 7], &device),
            actions: Tensor::zeros([1, 2, 7], &device),
            lang: None,
            idx: Tensor::zeros([1], &device),
        };

        let mut step = StepBatch::new();
        step.insert(ModalitySpec::vision("vis"), batch.clone()).unwrap();
        step.insert(ModalitySpec::language("lang"), batch.clone()).unwrap();
        assert!(step.insert(ModalitySpec::language("vis"), batch).is_err());

        let names: Vec<&str> = step.iter().map(|(spec, _)| spec.name.as_str()).collect();
        assert_eq!(names, vec!["vis", "lang"]);
        assert_eq!(step.get("lang").unwrap().seq_len(), 2);
    }
}
