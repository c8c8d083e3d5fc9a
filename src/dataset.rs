//! In-memory play data: fixed-length windows of teleoperated play

use burn::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

use crate::config::ProprioStateConfig;
use crate::error::{LmpError, Result, ensure_width};
use crate::modality::{DepthObs, ModalityBatch, ModalityKind, ModalitySpec, RgbObs, StepBatch};
use crate::training::StepSource;

/// Shape of every window in a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    pub seq_len: usize,
    pub channels: usize,
    /// Static camera `(height, width)`
    pub static_hw: (usize, usize),
    /// Gripper camera `(height, width)` when recorded
    pub gripper_hw: Option<(usize, usize)>,
    pub static_depth: bool,
    /// Width of the unfiltered robot observation
    pub raw_state: usize,
    pub action_dim: usize,
    /// Width of the instruction embedding for language datasets
    pub lang_features: Option<usize>,
}

impl WindowShape {
    fn image_len(&self, (h, w): (usize, usize)) -> usize {
        self.seq_len * self.channels * h * w
    }
}

/// One play window, flattened row-major
#[derive(Debug, Clone)]
pub struct PlayWindow {
    /// Position in the dataset, reported back as `idx`
    pub idx: i64,
    /// `[seq, channels, h, w]`
    pub rgb_static: Vec<f32>,
    pub rgb_gripper: Option<Vec<f32>>,
    /// `[seq, h, w]`
    pub depth_static: Option<Vec<f32>>,
    /// Unfiltered `[seq, raw_state]`
    pub robot_obs: Vec<f32>,
    /// `[seq, action_dim]`, gripper in the last column as +1/-1
    pub actions: Vec<f32>,
    pub lang: Option<Vec<f32>>,
}

pub struct PlayDataset {
    spec: ModalitySpec,
    shape: WindowShape,
    windows: Vec<PlayWindow>,
}

impl PlayDataset {
    pub fn new(spec: ModalitySpec, shape: WindowShape) -> Self {
        Self {
            spec,
            shape,
            windows: Vec::new(),
        }
    }

    /// Random windows for demo runs and tests.
    ///
    /// Actions follow the state so the decoder has something to learn; the
    /// gripper opens whenever the first state dimension is positive.
    pub fn synthetic(
        spec: ModalitySpec,
        shape: WindowShape,
        num_windows: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut dataset = Self::new(spec, shape);
        let uniform = |rng: &mut StdRng, n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.random_range(-1.0..1.0)).collect()
        };

        for _ in 0..num_windows {
            let robot_obs = uniform(rng, shape.seq_len * shape.raw_state);
            let mut actions = Vec::with_capacity(shape.seq_len * shape.action_dim);
            for t in 0..shape.seq_len {
                let state = &robot_obs[t * shape.raw_state..(t + 1) * shape.raw_state];
                for d in 0..shape.action_dim - 1 {
                    actions.push(0.5 * state[d % shape.raw_state]);
                }
                actions.push(if state[0] > 0.0 { 1.0 } else { -1.0 });
            }

            let lang = match (dataset.spec.kind, shape.lang_features) {
                (ModalityKind::Language, Some(n)) => Some(uniform(rng, n)),
                _ => None,
            };

            dataset.add(PlayWindow {
                idx: 0,
                rgb_static: (0..shape.image_len(shape.static_hw))
                    .map(|_| rng.random::<f32>())
                    .collect(),
                rgb_gripper: shape
                    .gripper_hw
                    .map(|hw| (0..shape.image_len(hw)).map(|_| rng.random::<f32>()).collect()),
                depth_static: shape.static_depth.then(|| {
                    let (h, w) = shape.static_hw;
                    (0..shape.seq_len * h * w)
                        .map(|_| rng.random::<f32>())
                        .collect()
                }),
                robot_obs,
                actions,
                lang,
            })?;
        }
        Ok(dataset)
    }

    /// Append a window after checking it against the dataset shape.
    pub fn add(&mut self, mut window: PlayWindow) -> Result<()> {
        let shape = &self.shape;
        ensure_width("rgb_static", shape.image_len(shape.static_hw), window.rgb_static.len())?;
        check_optional(
            "rgb_gripper",
            shape.gripper_hw.map(|hw| shape.image_len(hw)),
            window.rgb_gripper.as_ref(),
        )?;
        let (h, w) = shape.static_hw;
        check_optional(
            "depth_static",
            shape.static_depth.then_some(shape.seq_len * h * w),
            window.depth_static.as_ref(),
        )?;
        ensure_width("robot_obs", shape.seq_len * shape.raw_state, window.robot_obs.len())?;
        ensure_width("actions", shape.seq_len * shape.action_dim, window.actions.len())?;
        if self.spec.kind == ModalityKind::Language {
            check_optional("lang", shape.lang_features, window.lang.as_ref())?;
        }

        window.idx = self.windows.len() as i64;
        self.windows.push(window);
        Ok(())
    }

    pub fn spec(&self) -> &ModalitySpec {
        &self.spec
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn sample_batch(&self, batch_size: usize, rng: &mut StdRng) -> Vec<&PlayWindow> {
        let batch_size = batch_size.min(self.windows.len());
        self.windows.choose_multiple(rng, batch_size).collect()
    }

    /// Stack windows into tensors, filtering the robot state on the way.
    pub fn to_batch<B: Backend>(
        &self,
        windows: &[&PlayWindow],
        proprio: &ProprioStateConfig,
        device: &B::Device,
    ) -> Result<ModalityBatch<B>> {
        if windows.is_empty() {
            return Err(LmpError::EmptyBatch);
        }
        let shape = &self.shape;
        let batch = windows.len();
        let seq = shape.seq_len;
        let c = shape.channels;

        let (h, w) = shape.static_hw;
        let rgb_static = stack_flat::<B>(windows.iter().map(|win| Some(&win.rgb_static)), device)?
            .reshape([batch, seq, c, h, w]);
        let mut rgb_obs = RgbObs::new(rgb_static);
        if let Some((gh, gw)) = shape.gripper_hw {
            let gripper =
                stack_flat::<B>(windows.iter().map(|win| win.rgb_gripper.as_ref()), device)?;
            rgb_obs = rgb_obs.with_gripper(gripper.reshape([batch, seq, c, gh, gw]));
        }

        let depth_obs = DepthObs {
            depth_static: if shape.static_depth {
                let depth =
                    stack_flat::<B>(windows.iter().map(|win| win.depth_static.as_ref()), device)?;
                Some(depth.reshape([batch, seq, h, w]))
            } else {
                None
            },
            depth_gripper: None,
        };

        let mut state = Vec::with_capacity(batch * seq * proprio.n_state_obs());
        for window in windows {
            for raw in window.robot_obs.chunks(shape.raw_state) {
                state.extend(proprio.filter(raw)?);
            }
        }
        let robot_obs = Tensor::<B, 1>::from_floats(state.as_slice(), device).reshape([
            batch,
            seq,
            proprio.n_state_obs(),
        ]);

        let actions: Vec<f32> = windows.iter().flat_map(|win| win.actions.iter().copied()).collect();
        let actions = Tensor::<B, 1>::from_floats(actions.as_slice(), device).reshape([
            batch,
            seq,
            shape.action_dim,
        ]);

        let lang = match (self.spec.kind, shape.lang_features) {
            (ModalityKind::Language, Some(features)) => Some(
                stack_flat::<B>(windows.iter().map(|win| win.lang.as_ref()), device)?
                    .reshape([batch, features]),
            ),
            _ => None,
        };

        let idx: Vec<i64> = windows.iter().map(|win| win.idx).collect();
        Ok(ModalityBatch {
            rgb_obs,
            depth_obs,
            robot_obs,
            actions,
            lang,
            idx: Tensor::<B, 1, Int>::from_ints(idx.as_slice(), device),
        })
    }
}

/// Concatenate per-window buffers into one flat tensor
fn stack_flat<'a, B: Backend>(
    buffers: impl Iterator<Item = Option<&'a Vec<f32>>>,
    device: &B::Device,
) -> Result<Tensor<B, 1>> {
    let mut flat = Vec::new();
    for buffer in buffers {
        flat.extend_from_slice(buffer.ok_or(LmpError::MissingInput("window stream"))?);
    }
    Ok(Tensor::<B, 1>::from_floats(flat.as_slice(), device))
}

fn check_optional(what: &'static str, expected: Option<usize>, got: Option<&Vec<f32>>) -> Result<()> {
    match (expected, got) {
        (Some(expected), Some(got)) => ensure_width(what, expected, got.len()),
        (None, None) => Ok(()),
        (Some(_), None) => Err(LmpError::MissingInput(what)),
        (None, Some(_)) => Err(LmpError::InvalidConfig(format!(
            "{what} recorded but not part of the dataset shape"
        ))),
    }
}

/// Train and validation datasets sampled jointly, one batch per dataset per
/// step
pub struct PlayDataModule {
    train: Vec<PlayDataset>,
    val: Vec<PlayDataset>,
    proprio: ProprioStateConfig,
    batch_size: usize,
    rng: StdRng,
}

impl PlayDataModule {
    pub fn new(
        train: Vec<PlayDataset>,
        val: Vec<PlayDataset>,
        proprio: ProprioStateConfig,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let train_names: Vec<&str> = train.iter().map(|d| d.spec().name.as_str()).collect();
        let val_names: Vec<&str> = val.iter().map(|d| d.spec().name.as_str()).collect();
        if train_names != val_names {
            return Err(LmpError::InvalidConfig(format!(
                "train datasets {train_names:?} and validation datasets {val_names:?} differ"
            )));
        }
        if let Some((t, _)) = train
            .iter()
            .zip(&val)
            .find(|(t, v)| t.shape() != v.shape() || t.spec().kind != v.spec().kind)
        {
            return Err(LmpError::InvalidConfig(format!(
                "train and validation windows of '{}' differ in shape or goal modality",
                t.spec().name
            )));
        }
        if let Some(empty) = train.iter().chain(&val).find(|d| d.is_empty()) {
            return Err(LmpError::InvalidConfig(format!(
                "dataset '{}' has no windows",
                empty.spec().name
            )));
        }
        if batch_size == 0 {
            return Err(LmpError::InvalidConfig("batch_size must be non-zero".into()));
        }

        Ok(Self {
            train,
            val,
            proprio,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn step_batch<B: Backend>(
        datasets: &[PlayDataset],
        proprio: &ProprioStateConfig,
        batch_size: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<StepBatch<B>> {
        let mut step = StepBatch::new();
        for dataset in datasets {
            let windows = dataset.sample_batch(batch_size, rng);
            step.insert(dataset.spec().clone(), dataset.to_batch(&windows, proprio, device)?)?;
        }
        Ok(step)
    }
}

impl<B: Backend> StepSource<B> for PlayDataModule {
    fn modalities(&self) -> Vec<String> {
        self.train.iter().map(|d| d.spec().name.clone()).collect()
    }

    fn train_batch(&mut self, device: &B::Device) -> Result<StepBatch<B>> {
        Self::step_batch(&self.train, &self.proprio, self.batch_size, &mut self.rng, device)
    }

    fn val_batch(&mut self, device: &B::Device) -> Result<StepBatch<B>> {
        Self::step_batch(&self.val, &self.proprio, self.batch_size, &mut self.rng, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn shape() -> WindowShape {
        WindowShape {
            seq_len: 4,
            channels: 3,
            static_hw: (8, 8),
            gripper_hw: Some((4, 4)),
            static_depth: true,
            raw_state: 8,
            action_dim: 7,
            lang_features: Some(5),
        }
    }

    #[test]
    fn test_synthetic_windows_are_indexed() {
        let mut rng = StdRng::seed_from_u64(7);
        let dataset =
            PlayDataset::synthetic(ModalitySpec::vision("vis"), shape(), 6, &mut rng).unwrap();
        assert_eq!(dataset.len(), 6);
        let idx: Vec<i64> = dataset.windows.iter().map(|win| win.idx).collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 4, 5]);
        assert!(dataset.windows.iter().all(|w| w.lang.is_none()));
    }

    #[test]
    fn test_sample_batch_caps_at_len() {
        let mut rng = StdRng::seed_from_u64(1);
        let dataset =
            PlayDataset::synthetic(ModalitySpec::vision("vis"), shape(), 3, &mut rng).unwrap();
        assert_eq!(dataset.sample_batch(10, &mut rng).len(), 3);
        assert_eq!(dataset.sample_batch(2, &mut rng).len(), 2);
    }

    #[test]
    fn test_to_batch_shapes_and_filtering() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(3);
        let dataset =
            PlayDataset::synthetic(ModalitySpec::language("lang"), shape(), 4, &mut rng).unwrap();
        let proprio = ProprioStateConfig::new(vec![[0, 3], [3, 6], [7, 8]]);

        let windows = dataset.sample_batch(2, &mut rng);
        let batch = dataset
            .to_batch::<TestBackend>(&windows, &proprio, &device)
            .unwrap();

        assert_eq!(batch.rgb_obs.rgb_static.dims(), [2, 4, 3, 8, 8]);
        assert_eq!(batch.rgb_obs.rgb_gripper.unwrap().dims(), [2, 4, 3, 4, 4]);
        assert_eq!(batch.depth_obs.depth_static.unwrap().dims(), [2, 4, 8, 8]);
        assert_eq!(batch.robot_obs.dims(), [2, 4, 7]);
        assert_eq!(batch.actions.dims(), [2, 4, 7]);
        assert_eq!(batch.lang.unwrap().dims(), [2, 5]);
        assert_eq!(batch.idx.dims(), [2]);

        // Column 6 of the raw state is dropped
        let raw = &windows[0].robot_obs[..8];
        let filtered = batch.robot_obs.slice([0..1, 0..1, 0..7]);
        let filtered = filtered.into_data().to_vec::<f32>().unwrap();
        assert_eq!(filtered[..6], raw[..6]);
        assert_eq!(filtered[6], raw[7]);
    }

    #[test]
    fn test_add_rejects_wrong_lengths() {
        let mut dataset = PlayDataset::new(ModalitySpec::vision("vis"), shape());
        let result = dataset.add(PlayWindow {
            idx: 0,
            rgb_static: vec![0.0; 10],
            rgb_gripper: None,
            depth_static: None,
            robot_obs: Vec::new(),
            actions: Vec::new(),
            lang: None,
        });
        assert!(matches!(result, Err(LmpError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_data_module_yields_every_dataset() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(11);
        let make = |rng: &mut StdRng| {
            vec![
                PlayDataset::synthetic(ModalitySpec::vision("vis"), shape(), 4, rng).unwrap(),
                PlayDataset::synthetic(ModalitySpec::language("lang"), shape(), 4, rng).unwrap(),
            ]
        };
        let train = make(&mut rng);
        let val = make(&mut rng);
        let proprio = ProprioStateConfig::new(vec![[0, 3], [3, 6], [7, 8]]);
        let mut module = PlayDataModule::new(train, val, proprio, 2, 0).unwrap();

        let source: &mut dyn StepSource<TestBackend> = &mut module;
        assert_eq!(source.modalities(), vec!["vis".to_string(), "lang".to_string()]);
        let batch = source.train_batch(&device).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get("lang").unwrap().batch_size(), 2);
    }

    #[test]
    fn test_data_module_rejects_mismatched_splits() {
        let mut rng = StdRng::seed_from_u64(5);
        let proprio = ProprioStateConfig::new(vec![[0, 7]]);
        let train = vec![PlayDataset::synthetic(ModalitySpec::vision("vis"), shape(), 2, &mut rng).unwrap()];

        let longer = WindowShape {
            seq_len: 6,
            ..shape()
        };
        let val = PlayDataset::synthetic(ModalitySpec::vision("vis"), longer, 2, &mut rng).unwrap();
        assert_eq!(val.shape().seq_len, 6);
        let result = PlayDataModule::new(train, vec![val], proprio.clone(), 2, 0);
        assert!(matches!(result, Err(LmpError::InvalidConfig(_))));

        let train = vec![PlayDataset::synthetic(ModalitySpec::vision("vis"), shape(), 2, &mut rng).unwrap()];
        let relabeled =
            PlayDataset::synthetic(ModalitySpec::language("vis"), shape(), 2, &mut rng).unwrap();
        let result = PlayDataModule::new(train, vec![relabeled], proprio, 2, 0);
        assert!(matches!(result, Err(LmpError::InvalidConfig(_))));
    }
}
