// Word-to-region alignment. A matchmap scores every (word, image patch)
// pair in the shared embedding space; its max-over-patches mean is a
// whole-utterance similarity, and the margin loss pushes matched pairs
// above within-batch imposters on both the image and utterance sides.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};

/// Dot products between every token embedding `(k, e)` and every spatial
/// position of `(e, h, w)` image features, as `(k, h, w)`.
pub fn compute_matchmap(spatial: &Tensor, token_embs: &Tensor) -> Result<Tensor> {
    let (e, h, w) = spatial.dims3()?;
    let (k, te) = token_embs.dims2()?;
    ensure!(
        te == e,
        "token embedding dim {} does not match spatial dim {}",
        te,
        e
    );
    let flat = spatial.reshape((e, h * w))?;
    token_embs
        .matmul(&flat)?
        .reshape((k, h, w))
        .map_err(Into::into)
}

/// Whole-utterance similarity: each word takes its best-matching patch,
/// and the per-word maxima are averaged.
pub fn matchmap_similarity(matchmap: &Tensor) -> Result<Tensor> {
    let (k, h, w) = matchmap.dims3()?;
    let best = matchmap.reshape((k, h * w))?.max(D::Minus1)?;
    best.mean_all().map_err(Into::into)
}

/// Margin ranking loss over a batch of spatial image features
/// `(b, e, h, w)` and token embeddings `(b, k, e)` with per-example
/// utterance lengths. Each example is ranked against one resampled
/// imposter image and one imposter utterance.
pub fn triplet_loss(
    spatial: &Tensor,
    token_embs: &Tensor,
    lengths: &[usize],
    margin: f64,
) -> Result<Tensor> {
    use rand::Rng;

    let (batch, _e, _h, _w) = spatial.dims4()?;
    let (token_batch, max_k, _te) = token_embs.dims3()?;
    ensure!(
        batch == token_batch,
        "spatial batch {} does not match token batch {}",
        batch,
        token_batch
    );
    ensure!(batch >= 2, "imposter sampling needs at least two examples");
    ensure!(
        lengths.len() == batch,
        "got {} lengths for a batch of {}",
        lengths.len(),
        batch
    );
    for (i, &len) in lengths.iter().enumerate() {
        ensure!(
            len >= 1 && len <= max_k,
            "length {} at example {} outside 1..={}",
            len,
            i,
            max_k
        );
    }

    let mut rng = rand::thread_rng();
    let mut loss = Tensor::zeros((), DType::F32, spatial.device())?;
    for i in 0..batch {
        let imposter = loop {
            let j = rng.gen_range(0..batch);
            if j != i {
                break j;
            }
        };
        let own_spatial = spatial.get(i)?;
        let own_tokens = token_embs.get(i)?.narrow(0, 0, lengths[i])?;
        let anchor = matchmap_similarity(&compute_matchmap(&own_spatial, &own_tokens)?)?;

        let imposter_spatial = spatial.get(imposter)?;
        let image_imposter =
            matchmap_similarity(&compute_matchmap(&imposter_spatial, &own_tokens)?)?;
        let imposter_tokens = token_embs.get(imposter)?.narrow(0, 0, lengths[imposter])?;
        let text_imposter =
            matchmap_similarity(&compute_matchmap(&own_spatial, &imposter_tokens)?)?;

        let image_term = ((image_imposter - &anchor)? + margin)?.relu()?;
        let text_term = ((text_imposter - &anchor)? + margin)?.relu()?;
        loss = ((loss + image_term)? + text_term)?;
    }
    (loss / batch as f64).map_err(Into::into)
}
