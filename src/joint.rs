// Joint loss engine. One entry point runs the contrastive and captioning
// branches according to the lambda weights, records per-step metrics, and
// returns a differentiable scalar plus a plain-data record of what each
// branch measured. A second entry point folds an epoch of records into
// correctly weighted means: per-example for batch-level metrics,
// per-token for the cross-entropy family.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::loss::{masked_mean, LabelMasks};
use crate::metrics::{MetricRecorder, Stage};
use crate::model::{CaptioningModel, ContrastiveModel, ContrastiveOutput};

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Which masked cross-entropy variant enters the joint objective. All three
/// are always measured; this only selects the differentiable term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeVariant {
    FullMask,
    NoSos,
    NoSosEos,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointWeights {
    pub lambda_mm: f64,
    pub lambda_lm: f64,
    /// When true, a branch whose lambda is zero is skipped entirely
    /// instead of being run for its metrics.
    pub optimize_unused: bool,
    pub joint_ce_variant: CeVariant,
}

impl Default for JointWeights {
    fn default() -> Self {
        JointWeights {
            lambda_mm: 1.0,
            lambda_lm: 0.0,
            optimize_unused: false,
            joint_ce_variant: CeVariant::FullMask,
        }
    }
}

impl JointWeights {
    pub fn new(lambda_mm: f64, lambda_lm: f64) -> Self {
        JointWeights {
            lambda_mm,
            lambda_lm,
            ..Default::default()
        }
    }

    pub fn contrastive_enabled(&self) -> bool {
        self.lambda_mm != 0.0 || !self.optimize_unused
    }

    pub fn captioning_enabled(&self) -> bool {
        self.lambda_lm != 0.0 || !self.optimize_unused
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveStats {
    pub infonce_loss: f32,
    pub image_accuracy: f32,
    pub text_accuracy: f32,
    pub image_entropy: f32,
    pub text_entropy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionStats {
    pub ce_loss: f32,
    pub ce_loss_wo_sos: f32,
    pub ce_loss_wo_sos_eos: f32,
    pub n_tokens: usize,
    pub n_tokens_wo_sos: usize,
    pub n_tokens_wo_sos_eos: usize,
}

/// Everything one step measured, detached from the graph. Branch stats are
/// present exactly when the branch ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    pub batch_size: usize,
    pub contrastive: Option<ContrastiveStats>,
    pub captioning: Option<CaptionStats>,
    pub loss: f32,
}

/// Differentiable joint loss plus its detached record.
pub struct StepOutput {
    pub loss: Tensor,
    pub record: LossRecord,
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

pub fn calculate_joint_loss<M: ContrastiveModel, C: CaptioningModel>(
    model: &M,
    captioner: &C,
    batch: &Batch,
    stage: Stage,
    weights: &JointWeights,
    rec: &mut dyn MetricRecorder,
) -> Result<StepOutput> {
    let batch_size = batch.frames.dim(0)?;
    ensure!(
        batch.tokens.dim(0)? == batch_size && batch.lengths.dim(0)? == batch_size,
        "batch tensors disagree on batch size"
    );

    let mut joint = Tensor::zeros((), DType::F32, batch.frames.device())?;
    let mut contrastive_stats = None;
    let mut caption_stats = None;
    let mut reusable_features: Option<Tensor> = None;

    if weights.contrastive_enabled() {
        let ContrastiveOutput {
            loss,
            image_accuracy,
            text_accuracy,
            image_entropy,
            text_entropy,
            logits_per_image: _,
            logits_per_text: _,
            image_features,
            text_features: _,
        } = model.calculate_contrastive_loss(&batch.frames, &batch.tokens, &batch.lengths)?;
        let infonce_loss = loss.to_scalar::<f32>()?;

        rec.record(&stage.key("infonce_loss"), infonce_loss as f64);
        rec.record(&stage.key("image_accuracy"), image_accuracy as f64);
        rec.record(&stage.key("text_accuracy"), text_accuracy as f64);
        rec.record(&stage.key("image_entropy"), image_entropy as f64);
        rec.record(&stage.key("text_entropy"), text_entropy as f64);
        rec.record("temperature", model.temperature()? as f64);

        joint = (joint + (&loss * weights.lambda_mm)?)?;
        contrastive_stats = Some(ContrastiveStats {
            infonce_loss,
            image_accuracy,
            text_accuracy,
            image_entropy,
            text_entropy,
        });
        reusable_features = Some(image_features);
    }

    if weights.captioning_enabled() {
        // Image-conditioned decoding reuses the contrastive branch's
        // features when that branch ran on this step, and encodes the
        // frames fresh otherwise. Text states are never reused.
        let image_features = if captioner.captioning() {
            match reusable_features {
                Some(features) => Some(features),
                None => Some(model.image_features(&batch.frames)?),
            }
        } else {
            None
        };
        let ce = captioner.calculate_ce_loss(
            &batch.tokens,
            &batch.lengths,
            None,
            image_features.as_ref(),
        )?;
        let masks = LabelMasks::new(&ce.labels)?;
        let ce_full = masked_mean(&ce.per_token_ce, &masks.full, masks.n_full, "full")?;
        let ce_no_sos = masked_mean(&ce.per_token_ce, &masks.no_sos, masks.n_no_sos, "no_sos")?;
        let ce_no_sos_eos = masked_mean(
            &ce.per_token_ce,
            &masks.no_sos_eos,
            masks.n_no_sos_eos,
            "no_sos_eos",
        )?;

        let stats = CaptionStats {
            ce_loss: ce_full.to_scalar::<f32>()?,
            ce_loss_wo_sos: ce_no_sos.to_scalar::<f32>()?,
            ce_loss_wo_sos_eos: ce_no_sos_eos.to_scalar::<f32>()?,
            n_tokens: masks.n_full,
            n_tokens_wo_sos: masks.n_no_sos,
            n_tokens_wo_sos_eos: masks.n_no_sos_eos,
        };
        rec.record(&stage.key("ce_loss"), stats.ce_loss as f64);
        rec.record(&stage.key("ce_loss_wo_sos"), stats.ce_loss_wo_sos as f64);
        rec.record(
            &stage.key("ce_loss_wo_sos_eos"),
            stats.ce_loss_wo_sos_eos as f64,
        );

        let selected = match weights.joint_ce_variant {
            CeVariant::FullMask => &ce_full,
            CeVariant::NoSos => &ce_no_sos,
            CeVariant::NoSosEos => &ce_no_sos_eos,
        };
        joint = (joint + (selected * weights.lambda_lm)?)?;
        caption_stats = Some(stats);
    }

    let loss_value = joint.to_scalar::<f32>()?;
    rec.record(&stage.key("loss"), loss_value as f64);

    Ok(StepOutput {
        loss: joint,
        record: LossRecord {
            batch_size,
            contrastive: contrastive_stats,
            captioning: caption_stats,
            loss: loss_value,
        },
    })
}

// ---------------------------------------------------------------------------
// Epoch aggregation
// ---------------------------------------------------------------------------

/// Folds an epoch of step records into `_epoch` metrics and returns the
/// example-weighted mean joint loss. Batch-level metrics are weighted by
/// batch size; the cross-entropy family by surviving-token count, with
/// perplexity as the exponential of each token-weighted mean.
pub fn aggregate_epoch(
    records: &[LossRecord],
    stage: Stage,
    weights: &JointWeights,
    rec: &mut dyn MetricRecorder,
) -> Result<f64> {
    ensure!(!records.is_empty(), "cannot aggregate an empty epoch");
    let total_examples: f64 = records.iter().map(|r| r.batch_size as f64).sum();
    ensure!(total_examples > 0.0, "epoch contains no examples");

    let loss_epoch = records
        .iter()
        .map(|r| r.loss as f64 * r.batch_size as f64)
        .sum::<f64>()
        / total_examples;
    rec.record(&stage.epoch_key("loss"), loss_epoch);

    if weights.contrastive_enabled() {
        let stats: Vec<(&ContrastiveStats, usize)> = records
            .iter()
            .filter_map(|r| r.contrastive.as_ref().map(|s| (s, r.batch_size)))
            .collect();
        ensure!(
            stats.len() == records.len(),
            "contrastive stats missing from {} of {} step records",
            records.len() - stats.len(),
            records.len()
        );
        let fields: [(&str, fn(&ContrastiveStats) -> f32); 5] = [
            ("infonce_loss", |s| s.infonce_loss),
            ("image_accuracy", |s| s.image_accuracy),
            ("text_accuracy", |s| s.text_accuracy),
            ("image_entropy", |s| s.image_entropy),
            ("text_entropy", |s| s.text_entropy),
        ];
        for (name, field) in fields {
            let mean = stats
                .iter()
                .map(|(s, b)| field(s) as f64 * *b as f64)
                .sum::<f64>()
                / total_examples;
            rec.record(&stage.epoch_key(name), mean);
        }
    }

    if weights.captioning_enabled() {
        let stats: Vec<&CaptionStats> = records
            .iter()
            .filter_map(|r| r.captioning.as_ref())
            .collect();
        ensure!(
            stats.len() == records.len(),
            "captioning stats missing from {} of {} step records",
            records.len() - stats.len(),
            records.len()
        );
        type CaptionField = (
            &'static str,
            &'static str,
            fn(&CaptionStats) -> f32,
            fn(&CaptionStats) -> usize,
        );
        let fields: [CaptionField; 3] = [
            ("ce_loss", "perplexity", |s| s.ce_loss, |s| s.n_tokens),
            (
                "ce_loss_wo_sos",
                "perplexity_wo_sos",
                |s| s.ce_loss_wo_sos,
                |s| s.n_tokens_wo_sos,
            ),
            (
                "ce_loss_wo_sos_eos",
                "perplexity_wo_sos_eos",
                |s| s.ce_loss_wo_sos_eos,
                |s| s.n_tokens_wo_sos_eos,
            ),
        ];
        for (ce_name, ppl_name, value, count) in fields {
            let total_tokens: f64 = stats.iter().map(|s| count(s) as f64).sum();
            ensure!(total_tokens > 0.0, "epoch has no tokens under {}", ce_name);
            let mean = stats
                .iter()
                .map(|s| value(s) as f64 * count(s) as f64)
                .sum::<f64>()
                / total_tokens;
            rec.record(&stage.epoch_key(ce_name), mean);
            rec.record(&stage.epoch_key(ppl_name), mean.exp());
        }
    }

    Ok(loss_epoch)
}
