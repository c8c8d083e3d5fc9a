use std::env;
use std::path::{Path, PathBuf};

use burn::backend::Autodiff;
use burn::config::Config;
use dotenv::dotenv;
use play_lmp::config::{
    DecoderConfig, DepthConfig, GoalEncoderConfig, LanguageGoalConfig, PlanNetworkConfig,
    ProprioStateConfig, VisionEncoderConfig,
};
use play_lmp::dataset::{PlayDataModule, PlayDataset, WindowShape};
use play_lmp::metrics::{CsvSink, EpochMeanSink, FanoutSink, TracingSink};
use play_lmp::training::KlAnnealing;
use play_lmp::{ModalityKind, ModalitySpec, PlayLmpConfig, TrainConfig, Trainer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use time::{OffsetDateTime, format_description};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[cfg(not(feature = "metal"))]
type TrainBackend = Autodiff<burn::backend::NdArray<f32>>;
#[cfg(feature = "metal")]
type TrainBackend = Autodiff<burn::backend::Wgpu>;

const RAW_STATE: usize = 15;

fn get_env_var_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|val| val.parse::<usize>().ok())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("play_lmp=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Small model matching the synthetic windows below
fn default_config() -> PlayLmpConfig {
    PlayLmpConfig::new(
        VisionEncoderConfig::new().with_visual_features(32),
        ProprioStateConfig::new(vec![[0, 3], [3, 6], [7, 15]]),
        GoalEncoderConfig::new().with_hidden_size(64),
        PlanNetworkConfig::new().with_hidden_size(128),
        PlanNetworkConfig::new().with_hidden_size(128),
        DecoderConfig::new().with_hidden_size(128),
        vec![ModalitySpec::vision("vis"), ModalitySpec::language("lang")],
    )
    .with_vision_gripper(Some(VisionEncoderConfig::new().with_visual_features(16)))
    .with_depth_static(Some(DepthConfig::new()))
    .with_language_goal(Some(LanguageGoalConfig::new().with_lang_features(32)))
    .with_plan_features(32)
    .with_latent_goal_features(16)
}

fn window_shape(config: &PlayLmpConfig, kind: ModalityKind) -> WindowShape {
    WindowShape {
        seq_len: 8,
        channels: config.vision_static.num_c,
        static_hw: (32, 32),
        gripper_hw: config.vision_gripper.as_ref().map(|_| (16, 16)),
        static_depth: config.depth_static.is_some(),
        raw_state: RAW_STATE,
        action_dim: config.decoder.out_features,
        lang_features: match kind {
            ModalityKind::Language => config.language_goal.as_ref().map(|l| l.lang_features),
            ModalityKind::Vision => None,
        },
    }
}

fn synthetic_split(
    config: &PlayLmpConfig,
    windows: usize,
    rng: &mut StdRng,
) -> play_lmp::Result<Vec<PlayDataset>> {
    config
        .modalities
        .iter()
        .map(|spec| {
            PlayDataset::synthetic(spec.clone(), window_shape(config, spec.kind), windows, rng)
        })
        .collect()
}

fn run_dir(output_dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now.format(&format_description::parse(
        "[year][month][day]-[hour][minute][second]",
    )?)?;
    Ok(output_dir.join(stamp))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_logging();

    let epochs = get_env_var_usize("LMP_EPOCHS").unwrap_or(3);
    let steps_per_epoch = get_env_var_usize("LMP_STEPS_PER_EPOCH").unwrap_or(20);
    let batch_size = get_env_var_usize("LMP_BATCH_SIZE").unwrap_or(8);
    let seed = get_env_var_usize("LMP_SEED").unwrap_or(42) as u64;
    let output_dir = env::var("LMP_OUTPUT_DIR").unwrap_or_else(|_| "runs".to_string());

    let config = match env::var("LMP_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading model config from {}", path);
            PlayLmpConfig::load(&path)?
        }
        Err(_) => default_config(),
    };
    let sizes = config.resolve_input_sizes()?;
    tracing::info!("Resolved input sizes: {:?}", sizes);

    let run_dir = run_dir(Path::new(&output_dir))?;
    tracing::info!("Writing run to {}", run_dir.display());

    let mut rng = StdRng::seed_from_u64(seed);
    let train = synthetic_split(&config, 64, &mut rng)?;
    let val = synthetic_split(&config, 16, &mut rng)?;
    let mut data = PlayDataModule::new(
        train,
        val,
        config.proprio_state.clone(),
        batch_size,
        seed,
    )?;

    let train_config = TrainConfig {
        epochs,
        train_steps_per_epoch: steps_per_epoch,
        val_steps_per_epoch: (steps_per_epoch / 4).max(1),
        checkpoint_dir: run_dir.join("checkpoints").to_string_lossy().into_owned(),
        checkpoint_every: 1,
        kl_annealing: Some(
            KlAnnealing::new()
                .with_end(config.kl_beta)
                .with_end_epoch(epochs.saturating_sub(1)),
        ),
    };

    let csv = CsvSink::new(run_dir.join("metrics"))?;
    tracing::info!("Writing metrics to {}", csv.log_dir().display());
    let mut sink = EpochMeanSink::new(FanoutSink::new().with(TracingSink::new()).with(csv));

    let device = Default::default();
    let mut trainer = Trainer::<TrainBackend>::new(device, config, train_config)?;
    let summary = trainer.fit(&mut data, &mut sink)?;

    if let Some(last) = summary.validation.last() {
        tracing::info!(
            "Final validation: action_loss_pp={:.4}, action_loss_pr={:.4}, grip_sr_pp={:.3}",
            last.global.act_loss_pp,
            last.global.act_loss_pr,
            last.global.grip_sr_pp
        );
    }
    tracing::info!(
        "Saved {} checkpoints after {} steps",
        summary.checkpoints.len(),
        summary.steps
    );

    Ok(())
}
