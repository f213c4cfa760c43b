// Training loop: cosine-scheduled AdamW over the joint loss, epoch-level
// validation, forced-choice probes, and best-checkpoint tracking with
// patience-based early stopping.

use std::time::Instant;

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::data::{Batch, EvalTrial};
use crate::eval::score_trials;
use crate::joint::{aggregate_epoch, calculate_joint_loss, JointWeights};
use crate::metrics::{MetricRecorder, NullRecorder, Stage};
use crate::model::{CaptioningModel, ContrastiveModel};
use crate::runlog::RunLog;
use crate::vocab::Vocabulary;

// ---------------------------------------------------------------------------
// Learning-rate schedule
// ---------------------------------------------------------------------------

/// Linear warmup followed by cosine decay to `min_lr`.
pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            self.base_lr * (self.current_step as f64 + 1.0) / self.warmup_steps as f64
        } else {
            let progress = (self.current_step - self.warmup_steps) as f64
                / (self.total_steps - self.warmup_steps).max(1) as f64;
            let progress = progress.min(1.0);
            self.min_lr
                + 0.5
                    * (self.base_lr - self.min_lr)
                    * (1.0 + (std::f64::consts::PI * progress).cos())
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_fraction: f64,
    pub total_steps: usize,
    pub grad_accum_steps: usize,
    pub epochs: usize,
    pub log_every: usize,
    /// Epochs without val-loss improvement before stopping; 0 disables.
    pub patience: usize,
    pub checkpoint_path: Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            min_lr: 1e-5,
            weight_decay: 0.01,
            warmup_fraction: 0.1,
            total_steps: 1000,
            grad_accum_steps: 1,
            epochs: 10,
            log_every: 25,
            patience: 5,
            checkpoint_path: None,
        }
    }
}

impl TrainConfig {
    /// CPU-sized config for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            total_steps: 40,
            epochs: 2,
            log_every: 10,
            patience: 2,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
    pub optimizer: AdamW,
    pub scheduler: CosineScheduler,
    pub config: TrainConfig,
    pub varmap: VarMap,
    accum_count: usize,
    step_count: usize,
}

impl Trainer {
    pub fn new(varmap: VarMap, config: TrainConfig) -> Result<Self> {
        let warmup_steps = (config.total_steps as f64 * config.warmup_fraction) as usize;
        let scheduler =
            CosineScheduler::new(config.lr, config.min_lr, warmup_steps, config.total_steps);
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            optimizer,
            scheduler,
            config,
            varmap,
            accum_count: 0,
            step_count: 0,
        })
    }

    /// Accumulates one loss, stepping the optimizer and schedule every
    /// `grad_accum_steps` calls. Returns the step number when it stepped.
    pub fn accumulate_and_step(&mut self, loss: &Tensor) -> Result<Option<usize>> {
        let scale = 1.0 / self.config.grad_accum_steps as f64;
        let scaled_loss = (loss * scale)?;
        self.optimizer.backward_step(&scaled_loss)?;
        self.accum_count += 1;

        if self.accum_count >= self.config.grad_accum_steps {
            self.accum_count = 0;
            self.step_count += 1;
            let new_lr = self.scheduler.step();
            self.optimizer.set_learning_rate(new_lr);
            return Ok(Some(self.step_count));
        }
        Ok(None)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }
}

// ---------------------------------------------------------------------------
// Early stopping with best-checkpoint tracking
// ---------------------------------------------------------------------------

pub struct EarlyStopping {
    patience: usize,
    stale_count: usize,
    best_loss: f32,
    best_epoch: usize,
    best_path: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    pub fn new(patience: usize, best_path: Option<String>) -> Self {
        Self {
            patience,
            stale_count: 0,
            best_loss: f32::MAX,
            best_epoch: 0,
            best_path,
        }
    }

    /// Feed one monitored loss per epoch. Improvements save the checkpoint
    /// when `best_path` is set; `patience` stale epochs in a row stop the
    /// run, with patience 0 meaning never stop.
    pub fn check(&mut self, loss: f32, epoch: usize, varmap: &VarMap) -> EarlyStopAction {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_epoch = epoch;
            self.stale_count = 0;
            if let Some(ref path) = self.best_path {
                match save_checkpoint(varmap, path) {
                    Ok(()) => eprintln!("[BEST] loss {loss:.6} at epoch {epoch} -> {path}"),
                    Err(e) => eprintln!("[BEST] failed to save checkpoint: {e}"),
                }
            }
            return EarlyStopAction::NewBest;
        }
        if self.patience == 0 {
            return EarlyStopAction::Continue;
        }
        self.stale_count += 1;
        if self.stale_count >= self.patience {
            eprintln!(
                "[EARLY STOP] no improvement for {} epochs, best {:.6} at epoch {}",
                self.patience, self.best_loss, self.best_epoch
            );
            return EarlyStopAction::Stop;
        }
        EarlyStopAction::Continue
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

// ---------------------------------------------------------------------------
// Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(varmap: &VarMap, path: &str) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let named: std::collections::HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    eprintln!("[CHECKPOINT] saved {} tensors to {path}", named.len());
    Ok(())
}

/// Loads matching tensors into the varmap and returns how many matched.
pub fn load_checkpoint(varmap: &VarMap, path: &str, device: &Device) -> Result<usize> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved) = tensors.get(name) {
            var.set(saved)?;
            loaded += 1;
        }
    }
    eprintln!("[CHECKPOINT] loaded {loaded}/{} tensors from {path}", data.len());
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// Fit loop
// ---------------------------------------------------------------------------

pub struct FitData {
    pub train: Vec<Batch>,
    pub val: Vec<Batch>,
    pub trials: Vec<EvalTrial>,
    pub run_name: String,
}

pub struct FitReport {
    pub epochs_run: usize,
    pub final_train_loss: f64,
    pub best_val_loss: Option<f64>,
}

/// Runs the full training schedule: joint-loss steps over the training
/// batches, a validation pass whose per-step metrics are discarded in
/// favor of epoch aggregates, forced-choice probes when the contrastive
/// branch is active, and early stopping on the monitored loss.
pub fn fit<M: ContrastiveModel, C: CaptioningModel>(
    model: &M,
    captioner: &C,
    trainer: &mut Trainer,
    weights: &JointWeights,
    data: &FitData,
    vocab: &Vocabulary,
    rec: &mut dyn MetricRecorder,
    run_log: Option<&RunLog>,
) -> Result<FitReport> {
    ensure!(!data.train.is_empty(), "no training batches");

    let mut stopper = EarlyStopping::new(
        trainer.config.patience,
        trainer.config.checkpoint_path.clone(),
    );
    let mut best_val = None;
    let mut final_train = 0.0;
    let mut epochs_run = 0;

    for epoch in 0..trainer.config.epochs {
        epochs_run = epoch + 1;
        let epoch_timer = Instant::now();

        let mut records = Vec::with_capacity(data.train.len());
        for batch in &data.train {
            let step = calculate_joint_loss(model, captioner, batch, Stage::Train, weights, rec)?;
            trainer.accumulate_and_step(&step.loss)?;
            if trainer.config.log_every > 0 && trainer.step_count() % trainer.config.log_every == 0
            {
                eprintln!(
                    "[TRAIN] epoch {epoch} step {} loss {:.4} lr {:.2e}",
                    trainer.step_count(),
                    step.record.loss,
                    trainer.current_lr()
                );
            }
            records.push(step.record);
        }
        final_train = aggregate_epoch(&records, Stage::Train, weights, rec)?;
        let elapsed = epoch_timer.elapsed().as_secs_f64();
        eprintln!(
            "[TIMER] epoch {epoch}: {elapsed:.1}s ({} batches, {:.1} batches/sec)",
            data.train.len(),
            data.train.len() as f64 / elapsed.max(0.001)
        );

        let mut val_loss = None;
        if !data.val.is_empty() {
            let mut val_records = Vec::with_capacity(data.val.len());
            for batch in &data.val {
                let mut sink = NullRecorder;
                let step =
                    calculate_joint_loss(model, captioner, batch, Stage::Val, weights, &mut sink)?;
                val_records.push(step.record);
            }
            let loss = aggregate_epoch(&val_records, Stage::Val, weights, rec)?;
            best_val = Some(best_val.map_or(loss, |b: f64| b.min(loss)));
            val_loss = Some(loss);
        }

        if !data.trials.is_empty() && weights.contrastive_enabled() {
            let tally = score_trials(model, vocab, &data.trials, Stage::Val, rec)?;
            tally.report(Stage::Val);
        }

        if let Some(log) = run_log {
            log.log(&data.run_name, epoch, "train_loss", final_train)?;
            if let Some(v) = val_loss {
                log.log(&data.run_name, epoch, "val_loss", v)?;
            }
        }

        match val_loss {
            Some(v) => eprintln!(
                "[TRAIN] epoch {epoch} done: train_loss {final_train:.4} val_loss {v:.4}"
            ),
            None => eprintln!("[TRAIN] epoch {epoch} done: train_loss {final_train:.4}"),
        }

        let monitored = val_loss.unwrap_or(final_train);
        if stopper.check(monitored as f32, epoch, &trainer.varmap) == EarlyStopAction::Stop {
            break;
        }
    }

    Ok(FitReport {
        epochs_run,
        final_train_loss: final_train,
        best_val_loss: best_val,
    })
}
