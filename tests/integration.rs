// End-to-end integration tests
//
// Drives the full path: synthetic batches -> joint loss -> optimizer steps ->
// epoch aggregation -> forced-choice probes -> run log, with test-sized
// models on CPU.

use holophrase::data::{demo_vocabulary, synthetic_batch, synthetic_trial};
use holophrase::eval::score_trials;
use holophrase::joint::{aggregate_epoch, calculate_joint_loss, JointWeights};
use holophrase::metrics::{BufferRecorder, Stage};
use holophrase::model::{ContrastiveModel, DualEncoder, ModelConfig};
use holophrase::runlog::RunLog;
use holophrase::training::{fit, load_checkpoint, save_checkpoint, FitData, TrainConfig, Trainer};
use holophrase::vocab::Vocabulary;

use candle_core::Device;
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn test_model(seed: u64) -> anyhow::Result<(DualEncoder, VarMap, Vocabulary, StdRng, Device)> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let model = DualEncoder::new(ModelConfig::tiny(), &varmap, &device)?;
    let vocab = demo_vocabulary();
    let rng = StdRng::seed_from_u64(seed);
    Ok((model, varmap, vocab, rng, device))
}

// ---------------------------------------------------------------------------
// Joint loss over a real model
// ---------------------------------------------------------------------------

#[test]
fn test_joint_step_records_staged_metrics() -> anyhow::Result<()> {
    let (model, _varmap, vocab, mut rng, device) = test_model(1)?;
    let batch = synthetic_batch(&model.config, &vocab, 3, &device, &mut rng)?;
    let weights = JointWeights::new(1.0, 0.5);
    let mut rec = BufferRecorder::new();

    let step = calculate_joint_loss(&model, &model, &batch, Stage::Train, &weights, &mut rec)?;

    assert_eq!(step.loss.dims().len(), 0, "joint loss must be a scalar");
    assert!(step.record.loss.is_finite());
    assert_eq!(step.record.batch_size, 3);
    assert!(step.record.contrastive.is_some());
    assert!(step.record.captioning.is_some());

    for key in [
        "train_infonce_loss",
        "train_image_accuracy",
        "train_text_accuracy",
        "train_image_entropy",
        "train_text_entropy",
        "train_ce_loss",
        "train_ce_loss_wo_sos",
        "train_ce_loss_wo_sos_eos",
        "train_loss",
        "temperature",
    ] {
        assert!(rec.last(key).is_some(), "missing metric {key}");
    }
    Ok(())
}

#[test]
fn test_disabled_branches_yield_exact_zero() -> anyhow::Result<()> {
    let (model, _varmap, vocab, mut rng, device) = test_model(2)?;
    let batch = synthetic_batch(&model.config, &vocab, 2, &device, &mut rng)?;
    let mut weights = JointWeights::new(0.0, 0.0);
    weights.optimize_unused = true;
    let mut rec = BufferRecorder::new();

    let step = calculate_joint_loss(&model, &model, &batch, Stage::Train, &weights, &mut rec)?;

    assert_eq!(step.loss.dims().len(), 0);
    assert_eq!(step.loss.to_scalar::<f32>()?, 0.0);
    assert!(step.record.contrastive.is_none());
    assert!(step.record.captioning.is_none());
    assert_eq!(rec.keys(), vec!["train_loss"]);
    Ok(())
}

#[test]
fn test_contrastive_only_skips_caption_metrics() -> anyhow::Result<()> {
    let (model, _varmap, vocab, mut rng, device) = test_model(3)?;
    let batch = synthetic_batch(&model.config, &vocab, 2, &device, &mut rng)?;
    let mut weights = JointWeights::new(1.0, 0.0);
    weights.optimize_unused = true;
    let mut rec = BufferRecorder::new();

    let step = calculate_joint_loss(&model, &model, &batch, Stage::Val, &weights, &mut rec)?;

    assert!(step.record.contrastive.is_some());
    assert!(step.record.captioning.is_none());
    assert!(rec.last("val_infonce_loss").is_some());
    assert!(rec.last("val_ce_loss").is_none());
    Ok(())
}

// ---------------------------------------------------------------------------
// Optimization
// ---------------------------------------------------------------------------

#[test]
fn test_training_reduces_joint_loss() -> anyhow::Result<()> {
    let (model, varmap, vocab, mut rng, device) = test_model(4)?;
    let batch = synthetic_batch(&model.config, &vocab, 4, &device, &mut rng)?;
    let weights = JointWeights::new(1.0, 0.5);

    let mut config = TrainConfig::tiny();
    config.lr = 1e-3;
    config.total_steps = 30;
    config.log_every = 0;
    let mut trainer = Trainer::new(varmap, config)?;

    let mut first = None;
    let mut last = 0.0;
    for _ in 0..30 {
        let mut rec = BufferRecorder::new();
        let step =
            calculate_joint_loss(&model, &model, &batch, Stage::Train, &weights, &mut rec)?;
        trainer.accumulate_and_step(&step.loss)?;
        if first.is_none() {
            first = Some(step.record.loss);
        }
        last = step.record.loss;
    }

    let first = first.unwrap();
    assert!(
        last < first,
        "loss should fall when fitting one batch: {first} -> {last}"
    );
    Ok(())
}

#[test]
fn test_epoch_aggregation_over_live_steps() -> anyhow::Result<()> {
    let (model, _varmap, vocab, mut rng, device) = test_model(5)?;
    let weights = JointWeights::new(1.0, 0.5);
    let mut rec = BufferRecorder::new();

    let mut records = Vec::new();
    let mut step_losses = Vec::new();
    for batch_size in [2, 4] {
        let batch = synthetic_batch(&model.config, &vocab, batch_size, &device, &mut rng)?;
        let step =
            calculate_joint_loss(&model, &model, &batch, Stage::Train, &weights, &mut rec)?;
        step_losses.push(step.record.loss as f64);
        records.push(step.record);
    }

    let epoch_loss = aggregate_epoch(&records, Stage::Train, &weights, &mut rec)?;

    let lo = step_losses.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = step_losses.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    assert!(
        (lo..=hi).contains(&epoch_loss),
        "weighted mean {epoch_loss} outside [{lo}, {hi}]"
    );

    for key in [
        "train_loss_epoch",
        "train_infonce_loss_epoch",
        "train_ce_loss_epoch",
        "train_perplexity_epoch",
        "train_perplexity_wo_sos_epoch",
        "train_perplexity_wo_sos_eos_epoch",
    ] {
        assert!(rec.last(key).is_some(), "missing epoch metric {key}");
    }

    let ce = rec.last("train_ce_loss_epoch").unwrap();
    let ppl = rec.last("train_perplexity_epoch").unwrap();
    assert!((ppl - ce.exp()).abs() < 1e-9);
    Ok(())
}

// ---------------------------------------------------------------------------
// Forced-choice probes
// ---------------------------------------------------------------------------

#[test]
fn test_trial_scoring_with_real_model() -> anyhow::Result<()> {
    let (model, _varmap, vocab, mut rng, device) = test_model(6)?;
    let mut trials = Vec::new();
    for _ in 0..3 {
        trials.push(synthetic_trial(&model.config, &vocab, 4, &device, &mut rng)?);
    }

    let mut rec = BufferRecorder::new();
    let tally = score_trials(&model, &vocab, &trials, Stage::Test, &mut rec)?;

    assert_eq!(tally.total, 3);
    assert!((0.0..=1.0).contains(&tally.accuracy()));
    assert!(tally.mean_entropy().is_finite());
    assert_eq!(rec.series("test_accuracy").unwrap().len(), 3);
    assert_eq!(rec.series("test_entropy").unwrap().len(), 3);
    Ok(())
}

// ---------------------------------------------------------------------------
// Fit loop with run log and checkpointing
// ---------------------------------------------------------------------------

#[test]
fn test_fit_logs_epochs_to_run_log() -> anyhow::Result<()> {
    let (model, varmap, vocab, mut rng, device) = test_model(7)?;
    let cfg = model.config.clone();

    let data = FitData {
        train: vec![
            synthetic_batch(&cfg, &vocab, 2, &device, &mut rng)?,
            synthetic_batch(&cfg, &vocab, 2, &device, &mut rng)?,
        ],
        val: vec![synthetic_batch(&cfg, &vocab, 2, &device, &mut rng)?],
        trials: vec![synthetic_trial(&cfg, &vocab, 3, &device, &mut rng)?],
        run_name: "integration".to_string(),
    };

    let mut train_cfg = TrainConfig::tiny();
    train_cfg.epochs = 2;
    train_cfg.log_every = 0;
    let mut trainer = Trainer::new(varmap, train_cfg)?;

    let weights = JointWeights::new(1.0, 0.5);
    let log = RunLog::open(":memory:")?;
    let mut rec = BufferRecorder::new();
    let report = fit(
        &model, &model, &mut trainer, &weights, &data, &vocab, &mut rec, Some(&log),
    )?;

    let train_history = log.history("integration", "train_loss")?;
    let val_history = log.history("integration", "val_loss")?;
    assert_eq!(train_history.len(), report.epochs_run);
    assert_eq!(val_history.len(), report.epochs_run);
    assert_eq!(
        log.best("integration", "val_loss")?.map(|(_, v)| v),
        Some(report.best_val_loss.unwrap())
    );
    Ok(())
}

#[test]
fn test_checkpoint_restores_model_outputs() -> anyhow::Result<()> {
    let (model_a, varmap_a, vocab, mut rng, device) = test_model(8)?;
    let batch = synthetic_batch(&model_a.config, &vocab, 2, &device, &mut rng)?;

    let path = std::env::temp_dir().join("holophrase_integration_ckpt.safetensors");
    let path_str = path.to_str().unwrap().to_string();
    save_checkpoint(&varmap_a, &path_str)?;
    let expected: Vec<Vec<f32>> = model_a.image_features(&batch.frames)?.to_vec2()?;

    let varmap_b = VarMap::new();
    let model_b = DualEncoder::new(ModelConfig::tiny(), &varmap_b, &device)?;
    let loaded = load_checkpoint(&varmap_b, &path_str, &device)?;
    assert_eq!(loaded, varmap_b.all_vars().len());

    let restored: Vec<Vec<f32>> = model_b.image_features(&batch.frames)?.to_vec2()?;
    for (row_e, row_r) in expected.iter().zip(restored.iter()) {
        for (e, r) in row_e.iter().zip(row_r.iter()) {
            assert!((e - r).abs() < 1e-6, "feature drift after reload: {e} vs {r}");
        }
    }
    std::fs::remove_file(&path)?;
    Ok(())
}
