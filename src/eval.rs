// Forced-choice evaluation: one single-word query against N candidate
// frames, where the correct frame is always at index 0. Each trial is
// scored by the model's text-to-image similarity row, and results roll up
// into overall and per-category tallies.

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use candle_core::Tensor;

use crate::data::EvalTrial;
use crate::loss::{argmax_row, entropy_of_logits};
use crate::metrics::{MetricRecorder, Stage};
use crate::model::ContrastiveModel;
use crate::vocab::Vocabulary;

/// Outcome of one trial. `category` is the queried word itself, so
/// accuracy can be broken out per evaluation category.
#[derive(Debug, Clone)]
pub struct TrialScore {
    pub correct: bool,
    pub predicted: usize,
    pub entropy: f64,
    pub category: String,
}

pub fn score_trial<M: ContrastiveModel>(
    model: &M,
    vocab: &Vocabulary,
    trial: &EvalTrial,
) -> Result<TrialScore> {
    let (outer, n_candidates, c, h, w) = trial.frames.dims5()?;
    ensure!(
        outer == 1,
        "trial frames must carry a leading singleton, got {}",
        outer
    );
    ensure!(n_candidates >= 2, "a trial needs at least two candidates");
    let frames = trial.frames.reshape((n_candidates, c, h, w))?;

    let lengths = Tensor::from_vec(
        vec![trial.query_len as u32],
        (1,),
        trial.frames.device(),
    )?;
    let (_logits_per_image, logits_per_text) =
        model.similarities(&frames, &trial.query, &lengths)?;
    let rows: Vec<Vec<f32>> = logits_per_text.to_vec2()?;
    ensure!(
        rows.len() == 1 && rows[0].len() == n_candidates,
        "similarity row has shape ({}, {}), expected (1, {})",
        rows.len(),
        rows.first().map_or(0, |r| r.len()),
        n_candidates
    );
    let row = &rows[0];

    let query_ids: Vec<Vec<u32>> = trial.query.to_vec2()?;
    let category = vocab.index_to_word(query_ids[0][0])?.to_string();

    let predicted = argmax_row(row);
    Ok(TrialScore {
        correct: predicted == 0,
        predicted,
        entropy: entropy_of_logits(row),
        category,
    })
}

// ---------------------------------------------------------------------------
// Tallies
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TrialTally {
    pub correct: usize,
    pub total: usize,
    entropy_sum: f64,
    per_category: BTreeMap<String, (usize, usize)>,
}

impl TrialTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, score: &TrialScore) {
        self.total += 1;
        self.entropy_sum += score.entropy;
        let entry = self.per_category.entry(score.category.clone()).or_insert((0, 0));
        entry.1 += 1;
        if score.correct {
            self.correct += 1;
            entry.0 += 1;
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    pub fn mean_entropy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.entropy_sum / self.total as f64
    }

    pub fn category_accuracy(&self, category: &str) -> Option<f64> {
        self.per_category
            .get(category)
            .map(|&(correct, total)| correct as f64 / total as f64)
    }

    pub fn report(&self, stage: Stage) {
        eprintln!(
            "[EVAL] {} accuracy {:.3} over {} trials, mean entropy {:.3} nats",
            stage.as_str(),
            self.accuracy(),
            self.total,
            self.mean_entropy()
        );
        for (category, (correct, total)) in &self.per_category {
            eprintln!("[EVAL]   {category}: {correct}/{total}");
        }
    }
}

/// Scores a set of trials, recording overall and per-category metrics
/// under the given stage.
pub fn score_trials<M: ContrastiveModel>(
    model: &M,
    vocab: &Vocabulary,
    trials: &[EvalTrial],
    stage: Stage,
    rec: &mut dyn MetricRecorder,
) -> Result<TrialTally> {
    let mut tally = TrialTally::new();
    for trial in trials {
        let score = score_trial(model, vocab, trial)?;
        let hit = if score.correct { 1.0 } else { 0.0 };
        rec.record(&stage.key("accuracy"), hit);
        rec.record(&stage.key("entropy"), score.entropy);
        rec.record(&stage.key(&format!("accuracy_{}", score.category)), hit);
        tally.add(&score);
    }
    Ok(tally)
}
