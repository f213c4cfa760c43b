// holophrase unified binary
//
// Commands:
//   holophrase prepare <transcripts_dir> <out_dir>   Transcript ETL -> metadata + vocabulary
//   holophrase train [--config TIER] [--resume]      Joint-loss demo training on synthetic data
//   holophrase eval  [--config TIER]                 Forced-choice probe over synthetic trials
//
// Config tiers: test (default, CPU), default (d=512)
// GPU: auto-detected when compiled with --features cuda and tier is not "test"

use holophrase::data::{
    build_vocabulary, demo_vocabulary, prepare_metadata, synthetic_batch, synthetic_trial,
};
use holophrase::eval::score_trials;
use holophrase::joint::JointWeights;
use holophrase::metrics::{BufferRecorder, NullRecorder, Stage};
use holophrase::model::{DualEncoder, ModelConfig};
use holophrase::runlog::RunLog;
use holophrase::training::{fit, load_checkpoint, FitData, TrainConfig, Trainer};

use candle_core::Device;
use candle_nn::VarMap;
use rand::SeedableRng;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn model_config(&self) -> ModelConfig {
        match self {
            Self::Test => ModelConfig::tiny(),
            Self::Default => ModelConfig::default(),
        }
    }

    fn train_config(&self) -> TrainConfig {
        match self {
            Self::Test => TrainConfig::tiny(),
            Self::Default => TrainConfig::default(),
        }
    }
}

/// Select device: CUDA if available and not test tier, else CPU.
fn select_device(tier: ConfigTier) -> Device {
    if tier == ConfigTier::Test {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    eprintln!("[HOLOPHRASE] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    eprintln!("[HOLOPHRASE] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        } else {
            eprintln!("[HOLOPHRASE] CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        if tier != ConfigTier::Test {
            eprintln!(
                "[HOLOPHRASE] Built without CUDA feature, using CPU (rebuild with --features cuda for GPU)"
            );
        }
    }

    Device::Cpu
}

/// Parse --config TIER from args, returns (tier, remaining_args).
fn parse_config_tier(args: &[String]) -> (ConfigTier, Vec<String>) {
    let mut tier = ConfigTier::Test;
    let mut rest = Vec::new();
    let mut skip_next = false;

    for (i, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--config" {
            if let Some(next) = args.get(i + 1) {
                if let Some(t) = ConfigTier::from_str(next) {
                    tier = t;
                    skip_next = true;
                    continue;
                } else {
                    eprintln!("[HOLOPHRASE] Unknown config tier '{}', using test", next);
                    skip_next = true;
                    continue;
                }
            }
        } else {
            rest.push(arg.clone());
        }
    }

    (tier, rest)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let (tier, remaining) = parse_config_tier(&args[2..]);

    let result = match command {
        "prepare" => cmd_prepare(&remaining, tier),
        "train" => {
            let resume = remaining.iter().any(|a| a == "--resume");
            cmd_train(tier, resume)
        }
        "eval" => cmd_eval(tier),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[HOLOPHRASE] Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: holophrase <command> [--config test|default]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  prepare <transcripts_dir> <out_dir>  Build training metadata + vocabulary from CSV transcripts");
    eprintln!("  train [--resume]                     Train the dual encoder on a synthetic demo corpus");
    eprintln!("  eval                                 Score forced-choice trials with the saved checkpoint");
    eprintln!();
    eprintln!("Config tiers:");
    eprintln!("  test     d=32, 1 layer, CPU only (fast, for tests)");
    eprintln!("  default  d=512, 6 layers, auto-GPU");
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_prepare(args: &[String], tier: ConfigTier) -> anyhow::Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: holophrase prepare <transcripts_dir> <out_dir>");
    }
    let transcripts_dir = Path::new(&args[0]);
    let out_dir = Path::new(&args[1]);
    std::fs::create_dir_all(out_dir)?;

    let metadata = prepare_metadata(transcripts_dir)?;
    let min_count = if tier == ConfigTier::Test { 1 } else { 3 };
    let vocab = build_vocabulary(&metadata, min_count);

    let metadata_path = out_dir.join("metadata.json");
    let vocab_path = out_dir.join("vocab.json");
    metadata.save(&metadata_path)?;
    vocab.save(&vocab_path)?;

    eprintln!(
        "[HOLOPHRASE] Prepared {} utterance groups, vocabulary of {} words (min count {})",
        metadata.groups.len(),
        vocab.len(),
        min_count
    );
    eprintln!("[HOLOPHRASE] Wrote {:?} and {:?}", metadata_path, vocab_path);
    Ok(())
}

fn cmd_train(tier: ConfigTier, resume: bool) -> anyhow::Result<()> {
    let device = select_device(tier);
    let cfg = tier.model_config();
    let train_cfg = {
        let mut c = tier.train_config();
        c.checkpoint_path = Some("holophrase_best.safetensors".to_string());
        c
    };
    let vocab = demo_vocabulary();

    eprintln!(
        "[HOLOPHRASE] Config: {:?} | d_model={} | layers={} | embed={} | vocab={}",
        tier, cfg.d_model, cfg.n_layers, cfg.embed_dim, cfg.vocab_size
    );

    let varmap = VarMap::new();
    let model = DualEncoder::new(cfg.clone(), &varmap, &device)?;

    if resume {
        let ckpt = "holophrase_best.safetensors";
        anyhow::ensure!(
            Path::new(ckpt).exists(),
            "Cannot resume: {} not found",
            ckpt
        );
        load_checkpoint(&varmap, ckpt, &device)?;
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let (n_train, n_val, batch_size, n_trials) = match tier {
        ConfigTier::Test => (4, 1, 2, 2),
        ConfigTier::Default => (16, 2, 8, 8),
    };
    let mut train = Vec::with_capacity(n_train);
    for _ in 0..n_train {
        train.push(synthetic_batch(&cfg, &vocab, batch_size, &device, &mut rng)?);
    }
    let mut val = Vec::with_capacity(n_val);
    for _ in 0..n_val {
        val.push(synthetic_batch(&cfg, &vocab, batch_size, &device, &mut rng)?);
    }
    let mut trials = Vec::with_capacity(n_trials);
    for _ in 0..n_trials {
        trials.push(synthetic_trial(&cfg, &vocab, 4, &device, &mut rng)?);
    }

    let data = FitData {
        train,
        val,
        trials,
        run_name: format!("demo_{}", if tier == ConfigTier::Test { "test" } else { "default" }),
    };

    let weights = JointWeights::new(1.0, 0.5);
    let log = RunLog::open("runlog.sqlite")?;
    let mut rec = BufferRecorder::new();
    let mut trainer = Trainer::new(varmap, train_cfg)?;

    let report = fit(
        &model, &model, &mut trainer, &weights, &data, &vocab, &mut rec, Some(&log),
    )?;

    eprintln!(
        "[HOLOPHRASE] Done after {} epochs: train_loss {:.4}",
        report.epochs_run, report.final_train_loss
    );
    if let Some((epoch, loss)) = log.best(&data.run_name, "val_loss")? {
        eprintln!("[HOLOPHRASE] Best val_loss {:.4} at epoch {}", loss, epoch);
    }
    for key in rec.keys() {
        if key.ends_with("_epoch") {
            if let Some(v) = rec.last(key) {
                eprintln!("[HOLOPHRASE] {} = {:.4}", key, v);
            }
        }
    }
    Ok(())
}

fn cmd_eval(tier: ConfigTier) -> anyhow::Result<()> {
    let device = select_device(tier);
    let cfg = tier.model_config();
    let vocab = demo_vocabulary();

    let varmap = VarMap::new();
    let model = DualEncoder::new(cfg.clone(), &varmap, &device)?;

    let ckpt = "holophrase_best.safetensors";
    if Path::new(ckpt).exists() {
        load_checkpoint(&varmap, ckpt, &device)?;
    } else {
        eprintln!("[HOLOPHRASE] No checkpoint found, scoring with an untrained model");
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(23);
    let n_trials = if tier == ConfigTier::Test { 4 } else { 16 };
    let mut trials = Vec::with_capacity(n_trials);
    for _ in 0..n_trials {
        trials.push(synthetic_trial(&cfg, &vocab, 4, &device, &mut rng)?);
    }

    let mut sink = NullRecorder;
    let tally = score_trials(&model, &vocab, &trials, Stage::Test, &mut sink)?;
    tally.report(Stage::Test);
    println!(
        "forced_choice: {}/{} ({:.1}%)",
        tally.correct,
        tally.total,
        100.0 * tally.accuracy()
    );
    Ok(())
}
