// Data layer: transcript preprocessing, training metadata, vocabulary
// construction, and the tensor-level batch/trial types the loss engine
// consumes. Frame pixels are decoded upstream; everything here works with
// transcripts, metadata JSON, and already-materialized tensors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::ModelConfig;
use crate::vocab::{Vocabulary, TOK_EOS, TOK_PAD, TOK_SOS};

/// Transcripts come from long recordings; one utterance never claims more
/// than this many one-second frames.
pub const MAX_FRAMES_PER_UTTERANCE: usize = 20;

/// Caregiver speaker codes whose utterances are kept. Everything else
/// (child vocalizations, annotator notes) is dropped.
pub const ALLOWED_SPEAKERS: &[&str] = &[
    "M", "Mom", "mom", "m", "mother", "Mother", "papa", "the mom",
];

// ---------------------------------------------------------------------------
// Tensor-level types
// ---------------------------------------------------------------------------

/// One training batch: frames `(b, c, h, w)` f32, token ids `(b, s)` u32
/// padded with `<pad>`, and unpadded utterance lengths `(b,)` u32.
#[derive(Debug, Clone)]
pub struct Batch {
    pub frames: Tensor,
    pub tokens: Tensor,
    pub lengths: Tensor,
}

/// One forced-choice trial: candidate frames `(1, n, c, h, w)` with the
/// correct frame first, a `(1, 1)` u32 single-word query, and its length.
#[derive(Debug, Clone)]
pub struct EvalTrial {
    pub frames: Tensor,
    pub query: Tensor,
    pub query_len: usize,
}

// ---------------------------------------------------------------------------
// Transcript preprocessing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TranscriptRow {
    #[serde(rename = "Speaker")]
    speaker: String,
    #[serde(rename = "Utterance")]
    utterance: String,
    #[serde(rename = "Time")]
    time: String,
}

/// One aligned (utterance, frames) group, the unit the training set is
/// built from. `timestamps` are whole seconds into the source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceGroup {
    pub transcript_filename: String,
    pub video_filename: String,
    pub utterance: String,
    pub utterance_num: usize,
    pub num_frames: usize,
    pub frame_filenames: Vec<String>,
    pub timestamps: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub groups: Vec<UtteranceGroup>,
}

impl TrainingMetadata {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Strips annotator markup and transcription punctuation, lowercases, and
/// collapses whitespace. Sentence punctuation survives for
/// `split_utterances`.
pub fn clean_utterance(raw: &str) -> String {
    static SPANS: OnceLock<[Regex; 3]> = OnceLock::new();
    let spans = SPANS.get_or_init(|| {
        [
            Regex::new(r"\*[^*]*\*").expect("valid pattern"),
            Regex::new(r"\[[^\]]*\]").expect("valid pattern"),
            Regex::new(r"\([^)]*\)").expect("valid pattern"),
        ]
    });
    let mut text = raw.to_string();
    for pattern in spans {
        text = pattern.replace_all(&text, "").into_owned();
    }
    let text = text
        .replace("--", " ")
        .replace('-', "")
        .replace('"', "")
        .replace('*', "")
        .replace('_', "")
        .replace(',', "")
        .replace('…', "")
        .to_lowercase();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a cleaned line into sentence-level utterances on `. ? !`.
pub fn split_utterances(cleaned: &str) -> Vec<String> {
    cleaned
        .split(['.', '?', '!'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `H:MM:SS`, `M:SS`, or bare seconds into seconds.
pub fn parse_timestamp(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    ensure!(!raw.is_empty(), "empty timestamp");
    let parts: Vec<&str> = raw.split(':').collect();
    ensure!(parts.len() <= 3, "timestamp {:?} has too many fields", raw);
    let mut seconds = 0f64;
    for part in parts {
        let value: f64 = part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("timestamp {:?} is not numeric", raw))?;
        seconds = seconds * 60.0 + value;
    }
    Ok(seconds)
}

/// Splits the `[start, end]` second range evenly across `n_utterances` and
/// assigns each one consecutive whole-second frame timestamps, at least 1
/// and at most `MAX_FRAMES_PER_UTTERANCE` per utterance.
pub fn interpolate_frame_timestamps(start: f64, end: f64, n_utterances: usize) -> Vec<Vec<f64>> {
    if n_utterances == 0 {
        return Vec::new();
    }
    let bounds: Vec<i64> = (0..=n_utterances)
        .map(|i| (start + (end - start) * i as f64 / n_utterances as f64) as i64)
        .collect();
    bounds
        .windows(2)
        .map(|w| {
            let n_frames = (w[1] - w[0]).clamp(1, MAX_FRAMES_PER_UTTERANCE as i64) as usize;
            (0..n_frames).map(|k| (w[0] + k as i64) as f64).collect()
        })
        .collect()
}

/// Turns one transcript CSV into aligned utterance groups. Each row's time
/// span runs to the next row's start; the final row gets a single frame.
/// Rows from other speakers, rows with unparseable times, and rows whose
/// cleaned text is empty are dropped.
pub fn preprocess_transcript(path: &Path) -> Result<Vec<UtteranceGroup>> {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(s) => s.to_string(),
        None => bail!("transcript path {:?} has no usable stem", path),
    };
    let transcript_filename = format!("{stem}.csv");
    let video_filename = format!("{stem}.mp4");

    let mut reader = csv::Reader::from_path(path)?;
    let mut rows: Vec<TranscriptRow> = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    let starts: Vec<Option<f64>> = rows.iter().map(|r| parse_timestamp(&r.time).ok()).collect();

    let mut groups = Vec::new();
    let mut utterance_num = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let Some(start) = starts[i] else { continue };
        if !ALLOWED_SPEAKERS.contains(&row.speaker.trim()) {
            continue;
        }
        let end = if i + 1 < rows.len() {
            match starts[i + 1] {
                Some(t) => t,
                None => continue,
            }
        } else {
            start
        };
        ensure!(
            end >= start,
            "timestamps go backwards at row {} of {}",
            i,
            transcript_filename
        );

        let utterances = split_utterances(&clean_utterance(&row.utterance));
        if utterances.is_empty() {
            continue;
        }
        let schedule = interpolate_frame_timestamps(start, end, utterances.len());
        for (utterance, timestamps) in utterances.into_iter().zip(schedule) {
            let frame_filenames: Vec<String> = (0..timestamps.len())
                .map(|f| format!("{stem}_{utterance_num:03}_{f:02}.jpg"))
                .collect();
            groups.push(UtteranceGroup {
                transcript_filename: transcript_filename.clone(),
                video_filename: video_filename.clone(),
                utterance,
                utterance_num,
                num_frames: timestamps.len(),
                frame_filenames,
                timestamps,
            });
            utterance_num += 1;
        }
    }
    Ok(groups)
}

/// Preprocesses every `*.csv` transcript under a directory into one
/// metadata set, in path order.
pub fn prepare_metadata(transcripts_dir: &Path) -> Result<TrainingMetadata> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(transcripts_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == "csv"))
        .collect();
    paths.sort();
    ensure!(
        !paths.is_empty(),
        "no transcript csv files under {}",
        transcripts_dir.display()
    );

    let mut groups = Vec::new();
    for path in &paths {
        let parsed = preprocess_transcript(path)?;
        eprintln!("[DATA] {}: {} utterance groups", path.display(), parsed.len());
        groups.extend(parsed);
    }
    eprintln!(
        "[DATA] {} transcripts, {} utterance groups total",
        paths.len(),
        groups.len()
    );
    Ok(TrainingMetadata { groups })
}

// ---------------------------------------------------------------------------
// Vocabulary and splits
// ---------------------------------------------------------------------------

pub fn build_vocabulary(metadata: &TrainingMetadata, min_count: usize) -> Vocabulary {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for group in &metadata.groups {
        for word in group.utterance.split_whitespace() {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    Vocabulary::from_counts(&counts, min_count)
}

/// Seeded shuffle-and-split. The two halves are disjoint and cover the
/// input; `val_fraction` of the items (rounded down) land in the second.
pub fn train_val_split<T: Clone>(items: &[T], val_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let mut indices: Vec<usize> = (0..items.len()).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let n_val = (items.len() as f64 * val_fraction) as usize;
    let val = indices[..n_val].iter().map(|&i| items[i].clone()).collect();
    let train = indices[n_val..].iter().map(|&i| items[i].clone()).collect();
    (train, val)
}

// ---------------------------------------------------------------------------
// Synthetic data
// ---------------------------------------------------------------------------

/// Evaluation category nouns, doubling as content words for synthetic runs.
const DEMO_WORDS: &[&str] = &[
    "ball", "basket", "car", "cat", "chair", "computer", "crib", "door", "foot", "hand",
    "kitchen", "paper", "puzzle", "road", "room", "sand", "stairs", "table", "toy", "window",
];

pub fn demo_vocabulary() -> Vocabulary {
    let counts: HashMap<String, usize> = DEMO_WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i + 1))
        .collect();
    Vocabulary::from_counts(&counts, 1)
}

/// Random batch shaped like real data: Gaussian frames and well-formed
/// `<sos> words <eos> <pad>*` utterances drawn from the vocabulary's
/// content words.
pub fn synthetic_batch<R: Rng>(
    cfg: &ModelConfig,
    vocab: &Vocabulary,
    batch_size: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Batch> {
    ensure!(vocab.len() > 4, "vocabulary has no content words");
    ensure!(batch_size >= 1, "batch size must be positive");
    ensure!(cfg.max_len >= 3, "max_len cannot hold any utterance");

    let frames = Tensor::randn(
        0f32,
        1.0,
        (batch_size, cfg.frame_channels, cfg.frame_size, cfg.frame_size),
        device,
    )?;
    let mut tokens = Vec::with_capacity(batch_size * cfg.max_len);
    let mut lengths = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        let n_words = rng.gen_range(1..=cfg.max_len - 2);
        let mut row = vec![TOK_SOS];
        for _ in 0..n_words {
            row.push(rng.gen_range(4..vocab.len() as u32));
        }
        row.push(TOK_EOS);
        lengths.push(row.len() as u32);
        row.resize(cfg.max_len, TOK_PAD);
        tokens.extend(row);
    }
    Ok(Batch {
        frames,
        tokens: Tensor::from_vec(tokens, (batch_size, cfg.max_len), device)?,
        lengths: Tensor::from_vec(lengths, (batch_size,), device)?,
    })
}

/// Random forced-choice trial over `n_candidates` Gaussian frames and one
/// content-word query.
pub fn synthetic_trial<R: Rng>(
    cfg: &ModelConfig,
    vocab: &Vocabulary,
    n_candidates: usize,
    device: &Device,
    rng: &mut R,
) -> Result<EvalTrial> {
    ensure!(vocab.len() > 4, "vocabulary has no content words");
    ensure!(n_candidates >= 2, "a trial needs at least two candidates");
    let frames = Tensor::randn(
        0f32,
        1.0,
        (
            1,
            n_candidates,
            cfg.frame_channels,
            cfg.frame_size,
            cfg.frame_size,
        ),
        device,
    )?;
    let word = rng.gen_range(4..vocab.len() as u32);
    Ok(EvalTrial {
        frames,
        query: Tensor::from_vec(vec![word], (1, 1), device)?,
        query_len: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_clean_utterance_strips_markup() {
        let raw = "That's a *laughing* Ball -- a big, BIG one…";
        assert_eq!(clean_utterance(raw), "that's a ball a big big one");
        assert_eq!(clean_utterance("[noise] (unclear)"), "");
    }

    #[test]
    fn test_split_utterances_on_sentence_punctuation() {
        let parts = split_utterances("hello there. look at this! really?");
        assert_eq!(parts, vec!["hello there", "look at this", "really"]);
        assert!(split_utterances(" . ! ").is_empty());
    }

    #[test]
    fn test_parse_timestamp_forms() -> Result<()> {
        assert_eq!(parse_timestamp("1:02:03")?, 3723.0);
        assert_eq!(parse_timestamp("2:05")?, 125.0);
        assert_eq!(parse_timestamp("42")?, 42.0);
        assert!(parse_timestamp("abc").is_err());
        assert!(parse_timestamp("").is_err());
        Ok(())
    }

    #[test]
    fn test_interpolation_splits_and_clamps() {
        // Wide span: both utterances hit the per-utterance frame cap.
        let wide = interpolate_frame_timestamps(0.0, 100.0, 2);
        assert_eq!(wide.len(), 2);
        assert_eq!(wide[0].len(), MAX_FRAMES_PER_UTTERANCE);
        assert_eq!(wide[0][0], 0.0);
        assert_eq!(wide[1][0], 50.0);

        // Zero span still yields one frame.
        let point = interpolate_frame_timestamps(12.0, 12.0, 1);
        assert_eq!(point, vec![vec![12.0]]);

        // Consecutive seconds inside a small span.
        let small = interpolate_frame_timestamps(5.0, 10.0, 1);
        assert_eq!(small, vec![vec![5.0, 6.0, 7.0, 8.0, 9.0]]);
    }

    #[test]
    fn test_preprocess_transcript_end_to_end() -> Result<()> {
        let dir = std::env::temp_dir().join("holophrase_transcript_test");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("vid_001.csv");
        std::fs::write(
            &path,
            "Speaker,Utterance,Time\n\
             Mom,look at the ball. do you see it?,0:00:05\n\
             Auntie,this row is not a caregiver,0:00:10\n\
             Mom,that's a cat,0:00:12\n",
        )?;

        let groups = preprocess_transcript(&path)?;
        std::fs::remove_file(&path)?;

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].utterance, "look at the ball");
        assert_eq!(groups[1].utterance, "do you see it");
        assert_eq!(groups[2].utterance, "that's a cat");

        // Row one spans 5..10 split over two utterances: bounds 5, 7, 10.
        assert_eq!(groups[0].timestamps, vec![5.0, 6.0]);
        assert_eq!(groups[1].timestamps, vec![7.0, 8.0, 9.0]);
        // Final row has no successor and gets a single frame.
        assert_eq!(groups[2].timestamps, vec![12.0]);

        assert_eq!(groups[0].utterance_num, 0);
        assert_eq!(groups[2].utterance_num, 2);
        assert_eq!(groups[0].frame_filenames[0], "vid_001_000_00.jpg");
        assert_eq!(groups[1].frame_filenames[2], "vid_001_001_02.jpg");
        assert_eq!(groups[2].video_filename, "vid_001.mp4");
        assert_eq!(groups[0].num_frames, 2);
        Ok(())
    }

    #[test]
    fn test_metadata_round_trip() -> Result<()> {
        let metadata = TrainingMetadata {
            groups: vec![UtteranceGroup {
                transcript_filename: "a.csv".into(),
                video_filename: "a.mp4".into(),
                utterance: "the ball".into(),
                utterance_num: 0,
                num_frames: 2,
                frame_filenames: vec!["a_000_00.jpg".into(), "a_000_01.jpg".into()],
                timestamps: vec![3.0, 4.0],
            }],
        };
        let path = std::env::temp_dir().join("holophrase_metadata_test.json");
        metadata.save(&path)?;
        let loaded = TrainingMetadata::load(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded.groups, metadata.groups);
        Ok(())
    }

    #[test]
    fn test_build_vocabulary_respects_min_count() {
        let group = |utterance: &str| UtteranceGroup {
            transcript_filename: "a.csv".into(),
            video_filename: "a.mp4".into(),
            utterance: utterance.into(),
            utterance_num: 0,
            num_frames: 1,
            frame_filenames: vec![],
            timestamps: vec![0.0],
        };
        let metadata = TrainingMetadata {
            groups: vec![group("the ball"), group("the cat")],
        };
        let vocab = build_vocabulary(&metadata, 2);
        assert!(vocab.id_for("the") >= 4);
        assert_eq!(vocab.id_for("ball"), crate::vocab::TOK_UNK);
    }

    #[test]
    fn test_train_val_split_is_seeded_and_disjoint() {
        let items: Vec<usize> = (0..100).collect();
        let (train_a, val_a) = train_val_split(&items, 0.2, 7);
        let (train_b, val_b) = train_val_split(&items, 0.2, 7);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
        assert_eq!(val_a.len(), 20);
        assert_eq!(train_a.len() + val_a.len(), items.len());
        let mut all: Vec<usize> = train_a.iter().chain(val_a.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, items);

        let (_, val_c) = train_val_split(&items, 0.2, 8);
        assert_ne!(val_a, val_c);
    }

    #[test]
    fn test_synthetic_batch_is_well_formed() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let vocab = demo_vocabulary();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let batch = synthetic_batch(&cfg, &vocab, 4, &Device::Cpu, &mut rng)?;

        assert_eq!(
            batch.frames.dims4()?,
            (4, cfg.frame_channels, cfg.frame_size, cfg.frame_size)
        );
        let tokens: Vec<Vec<u32>> = batch.tokens.to_vec2()?;
        let lengths: Vec<u32> = batch.lengths.to_vec1()?;
        for (row, &len) in tokens.iter().zip(&lengths) {
            let len = len as usize;
            assert!(len >= 3 && len <= cfg.max_len);
            assert_eq!(row[0], TOK_SOS);
            assert_eq!(row[len - 1], TOK_EOS);
            for &id in &row[len..] {
                assert_eq!(id, TOK_PAD);
            }
        }
        Ok(())
    }

    #[test]
    fn test_synthetic_trial_is_well_formed() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let vocab = demo_vocabulary();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let trial = synthetic_trial(&cfg, &vocab, 4, &Device::Cpu, &mut rng)?;
        let (outer, n, c, h, w) = trial.frames.dims5()?;
        assert_eq!(
            (outer, n, c, h, w),
            (1, 4, cfg.frame_channels, cfg.frame_size, cfg.frame_size)
        );
        let query: Vec<Vec<u32>> = trial.query.to_vec2()?;
        assert!(query[0][0] >= 4);
        assert_eq!(trial.query_len, 1);
        Ok(())
    }

    #[test]
    fn test_demo_vocabulary_contains_categories() {
        let vocab = demo_vocabulary();
        assert_eq!(vocab.len(), 4 + DEMO_WORDS.len());
        assert!(vocab.id_for("ball") >= 4);
        assert!(vocab.id_for("window") >= 4);
    }
}
