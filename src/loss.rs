// Token-level loss machinery: per-position cross-entropy, the nested label
// masks that exclude control tokens, and the host-side metric helpers used
// by both training and evaluation.
//
// Masks are built on the host from the raw label ids and uploaded as f32
// tensors. Multiplying by an explicit mask keeps the reduction honest even
// when every position is real, and gives all three variants the same code
// path.

use anyhow::{ensure, Result};
use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;

use crate::vocab::{TOK_EOS, TOK_PAD, TOK_SOS};

// ---------------------------------------------------------------------------
// Label masks
// ---------------------------------------------------------------------------

/// Three nested masks over a `(batch, seq)` label tensor, f32 with 1.0 at
/// kept positions. `full` keeps everything but padding, `no_sos` further
/// drops `<sos>`, `no_sos_eos` drops `<eos>` as well. Each mask also carries
/// its surviving-token count, so nesting holds by construction:
/// `n_full >= n_no_sos >= n_no_sos_eos`.
pub struct LabelMasks {
    pub full: Tensor,
    pub no_sos: Tensor,
    pub no_sos_eos: Tensor,
    pub n_full: usize,
    pub n_no_sos: usize,
    pub n_no_sos_eos: usize,
}

impl LabelMasks {
    pub fn new(labels: &Tensor) -> Result<Self> {
        let (batch, seq) = labels.dims2()?;
        let rows: Vec<Vec<u32>> = labels.to_vec2()?;

        let mut full = Vec::with_capacity(batch * seq);
        let mut no_sos = Vec::with_capacity(batch * seq);
        let mut no_sos_eos = Vec::with_capacity(batch * seq);
        let (mut n_full, mut n_no_sos, mut n_no_sos_eos) = (0usize, 0usize, 0usize);

        for row in &rows {
            for &id in row {
                let keep_full = id != TOK_PAD;
                let keep_no_sos = keep_full && id != TOK_SOS;
                let keep_no_sos_eos = keep_no_sos && id != TOK_EOS;
                full.push(keep_full as u32 as f32);
                no_sos.push(keep_no_sos as u32 as f32);
                no_sos_eos.push(keep_no_sos_eos as u32 as f32);
                n_full += keep_full as usize;
                n_no_sos += keep_no_sos as usize;
                n_no_sos_eos += keep_no_sos_eos as usize;
            }
        }

        let device = labels.device();
        Ok(LabelMasks {
            full: Tensor::from_vec(full, (batch, seq), device)?,
            no_sos: Tensor::from_vec(no_sos, (batch, seq), device)?,
            no_sos_eos: Tensor::from_vec(no_sos_eos, (batch, seq), device)?,
            n_full,
            n_no_sos,
            n_no_sos_eos,
        })
    }
}

/// Mask-weighted mean of a per-token tensor: `(values * mask).sum() / n`.
/// A mask that keeps nothing has no defined mean and aborts the step.
pub fn masked_mean(per_token: &Tensor, mask: &Tensor, n_tokens: usize, name: &str) -> Result<Tensor> {
    ensure!(
        n_tokens > 0,
        "{name} mask keeps no tokens, cannot reduce {:?}",
        per_token.shape()
    );
    let total = (per_token * mask)?.sum_all()?;
    (total / n_tokens as f64).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Cross-entropy
// ---------------------------------------------------------------------------

/// Per-position cross-entropy for `(batch, seq, vocab)` logits against
/// `(batch, seq)` u32 labels, returned unreduced as `(batch, seq)`.
pub fn tokenwise_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq, vocab) = logits.dims3()?;
    let (lb, ls) = labels.dims2()?;
    ensure!(
        lb == batch && ls == seq,
        "labels {:?} do not match logits {:?}",
        labels.shape(),
        logits.shape()
    );
    let flat = logits.reshape((batch * seq, vocab))?;
    let log_probs = log_softmax(&flat, 1)?;
    let flat_labels = labels.reshape((batch * seq,))?;
    let one_hot = one_hot(&flat_labels, vocab)?;
    let per_position = (one_hot * log_probs)?.sum(1)?.neg()?;
    per_position.reshape((batch, seq)).map_err(Into::into)
}

/// One-hot expansion of a flat u32 index tensor, built on the host.
fn one_hot(indices: &Tensor, num_classes: usize) -> Result<Tensor> {
    let ids: Vec<u32> = indices.to_vec1()?;
    let mut data = vec![0f32; ids.len() * num_classes];
    for (row, &id) in ids.iter().enumerate() {
        ensure!(
            (id as usize) < num_classes,
            "label id {} out of range for {} classes",
            id,
            num_classes
        );
        data[row * num_classes + id as usize] = 1.0;
    }
    Tensor::from_vec(data, (ids.len(), num_classes), indices.device()).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Host-side metrics
// ---------------------------------------------------------------------------

/// Mean Shannon entropy (nats) of the softmax rows of a 2-d logit tensor.
/// Computed through log-softmax so saturated logits stay finite.
pub fn mean_row_entropy(logits: &Tensor) -> Result<f32> {
    let log_probs = log_softmax(logits, D::Minus1)?;
    let probs = log_probs.exp()?;
    let row_entropy = (probs * log_probs)?.sum(D::Minus1)?.neg()?;
    row_entropy.mean_all()?.to_scalar::<f32>().map_err(Into::into)
}

/// Shannon entropy (nats) of the softmax of a single logit row.
pub fn entropy_of_logits(row: &[f32]) -> f64 {
    let max = row.iter().fold(f64::NEG_INFINITY, |m, &x| m.max(x as f64));
    let exps: Vec<f64> = row.iter().map(|&x| (x as f64 - max).exp()).collect();
    let z: f64 = exps.iter().sum();
    let mut entropy = 0.0;
    for e in exps {
        let p = e / z;
        if p > 0.0 {
            entropy -= p * p.ln();
        }
    }
    entropy
}

/// Index of the largest value in a logit row.
pub fn argmax_row(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Fraction of rows of a square similarity matrix whose argmax lies on the
/// diagonal. This is batch retrieval accuracy when row i belongs with
/// column i.
pub fn retrieval_accuracy(logits: &Tensor) -> Result<f32> {
    let rows: Vec<Vec<f32>> = logits.to_vec2()?;
    ensure!(!rows.is_empty(), "cannot score an empty similarity matrix");
    let hits = rows
        .iter()
        .enumerate()
        .filter(|(i, row)| argmax_row(row) == *i)
        .count();
    Ok(hits as f32 / rows.len() as f32)
}
