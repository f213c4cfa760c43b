// Dual-encoder model: frames and utterances meet in one shared embedding
// space with a learned temperature. The same module also exposes the
// captioning head, where the decoder consumes image features through a
// one-slot prefix.

use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::encoder::{FrameEncoder, UtteranceEncoder};
use crate::loss::{mean_row_entropy, retrieval_accuracy, tokenwise_cross_entropy};

/// Temperature starts at 0.07; the parameter stores its negative log.
const INIT_NEG_LOG_TEMPERATURE: f64 = 2.6593;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub embed_dim: usize,
    pub frame_channels: usize,
    pub frame_size: usize,
    pub patch_size: usize,
    pub conv_channels: usize,
    pub vocab_size: usize,
    pub max_len: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub normalize_features: bool,
    pub captioning: bool,
}

impl ModelConfig {
    pub fn default() -> Self {
        ModelConfig {
            embed_dim: 512,
            frame_channels: 3,
            frame_size: 224,
            patch_size: 16,
            conv_channels: 256,
            vocab_size: 4096,
            max_len: 25,
            d_model: 512,
            n_layers: 6,
            n_heads: 8,
            d_ff: 2048,
            normalize_features: true,
            captioning: true,
        }
    }

    /// CPU-sized config for tests and smoke runs.
    pub fn tiny() -> Self {
        ModelConfig {
            embed_dim: 16,
            frame_channels: 3,
            frame_size: 16,
            patch_size: 8,
            conv_channels: 16,
            vocab_size: 64,
            max_len: 12,
            d_model: 32,
            n_layers: 1,
            n_heads: 2,
            d_ff: 64,
            normalize_features: true,
            captioning: true,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}

// ---------------------------------------------------------------------------
// Outputs and seams
// ---------------------------------------------------------------------------

/// Everything the contrastive branch produces in one forward pass. The
/// feature tensors are kept so downstream consumers can reuse them instead
/// of re-encoding the batch.
pub struct ContrastiveOutput {
    pub loss: Tensor,
    pub image_accuracy: f32,
    pub text_accuracy: f32,
    pub image_entropy: f32,
    pub text_entropy: f32,
    pub logits_per_image: Tensor,
    pub logits_per_text: Tensor,
    pub image_features: Tensor,
    pub text_features: Tensor,
}

/// Unreduced captioning output: per-position cross-entropy and the labels
/// it was scored against, both `(batch, seq)`.
pub struct CaptionCe {
    pub per_token_ce: Tensor,
    pub labels: Tensor,
}

pub trait ContrastiveModel {
    fn calculate_contrastive_loss(
        &self,
        frames: &Tensor,
        tokens: &Tensor,
        lengths: &Tensor,
    ) -> Result<ContrastiveOutput>;

    /// Global image features for a `(batch, c, h, w)` frame tensor.
    fn image_features(&self, frames: &Tensor) -> Result<Tensor>;

    /// Temperature-scaled similarity logits as
    /// `(logits_per_image, logits_per_text)`; the second is the transpose
    /// of the first.
    fn similarities(
        &self,
        frames: &Tensor,
        tokens: &Tensor,
        lengths: &Tensor,
    ) -> Result<(Tensor, Tensor)>;

    /// Current softmax temperature (exp of the negated parameter).
    fn temperature(&self) -> Result<f32>;
}

pub trait CaptioningModel {
    /// Per-token cross-entropy over the full label sequence, `<sos>`
    /// included. `outputs` is accepted for callers that hold precomputed
    /// text states; implementations may ignore it and rebuild their own.
    /// When image conditioning is on, `image_features` must be provided.
    fn calculate_ce_loss(
        &self,
        tokens: &Tensor,
        lengths: &Tensor,
        outputs: Option<&Tensor>,
        image_features: Option<&Tensor>,
    ) -> Result<CaptionCe>;

    /// Whether decoding is conditioned on image features.
    fn captioning(&self) -> bool;
}

// ---------------------------------------------------------------------------
// DualEncoder
// ---------------------------------------------------------------------------

pub struct DualEncoder {
    pub config: ModelConfig,
    frames: FrameEncoder,
    utterances: UtteranceEncoder,
    neg_log_tau: Tensor,
}

impl DualEncoder {
    pub fn new(config: ModelConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, candle_core::DType::F32, device);
        Self::from_vb(config, vb)
    }

    pub fn from_vb(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(config.vocab_size >= 4, "vocab must hold the control tokens");
        let frames = FrameEncoder::new(&config, vb.pp("frames"))?;
        let utterances = UtteranceEncoder::new(&config, vb.pp("utterances"))?;
        let neg_log_tau = vb.get_with_hints(
            1,
            "logit_neg_log_temperature",
            Init::Const(INIT_NEG_LOG_TEMPERATURE),
        )?;
        Ok(DualEncoder {
            config,
            frames,
            utterances,
            neg_log_tau,
        })
    }

    fn normalize(&self, features: Tensor) -> Result<Tensor> {
        if !self.config.normalize_features {
            return Ok(features);
        }
        let norms = features.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        features
            .broadcast_div(&norms.affine(1.0, 1e-8)?)
            .map_err(Into::into)
    }

    pub fn text_features(&self, tokens: &Tensor, lengths: &Tensor) -> Result<Tensor> {
        self.normalize(self.utterances.pooled(tokens, lengths)?)
    }

    fn scaled_similarities(&self, image: &Tensor, text: &Tensor) -> Result<Tensor> {
        let logits = image.matmul(&text.t()?.contiguous()?)?;
        logits
            .broadcast_mul(&self.neg_log_tau.exp()?)
            .map_err(Into::into)
    }

    /// Per-patch frame features for alignment maps, `(batch, embed, g, g)`.
    pub fn spatial_image_features(&self, frames: &Tensor) -> Result<Tensor> {
        self.frames.spatial_features(frames)
    }

    /// Context-free word embeddings in the shared space, `(batch, seq, embed)`.
    pub fn word_features(&self, tokens: &Tensor) -> Result<Tensor> {
        self.utterances.embed_words(tokens)
    }
}

impl ContrastiveModel for DualEncoder {
    fn calculate_contrastive_loss(
        &self,
        frames: &Tensor,
        tokens: &Tensor,
        lengths: &Tensor,
    ) -> Result<ContrastiveOutput> {
        let image_features = self.image_features(frames)?;
        let text_features = self.text_features(tokens, lengths)?;
        let batch = image_features.dim(0)?;
        ensure!(
            batch == text_features.dim(0)?,
            "frame and utterance batch sizes disagree"
        );

        let logits_per_image = self.scaled_similarities(&image_features, &text_features)?;
        let logits_per_text = logits_per_image.t()?.contiguous()?;
        let targets = Tensor::arange(0u32, batch as u32, frames.device())?;

        let image_loss = candle_nn::loss::cross_entropy(&logits_per_image, &targets)?;
        let text_loss = candle_nn::loss::cross_entropy(&logits_per_text, &targets)?;
        let loss = ((image_loss + text_loss)? * 0.5)?;

        Ok(ContrastiveOutput {
            image_accuracy: retrieval_accuracy(&logits_per_image)?,
            text_accuracy: retrieval_accuracy(&logits_per_text)?,
            image_entropy: mean_row_entropy(&logits_per_image)?,
            text_entropy: mean_row_entropy(&logits_per_text)?,
            loss,
            logits_per_image,
            logits_per_text,
            image_features,
            text_features,
        })
    }

    fn image_features(&self, frames: &Tensor) -> Result<Tensor> {
        self.normalize(self.frames.forward(frames)?)
    }

    fn similarities(
        &self,
        frames: &Tensor,
        tokens: &Tensor,
        lengths: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let image_features = self.image_features(frames)?;
        let text_features = self.text_features(tokens, lengths)?;
        let logits_per_image = self.scaled_similarities(&image_features, &text_features)?;
        let logits_per_text = logits_per_image.t()?.contiguous()?;
        Ok((logits_per_image, logits_per_text))
    }

    fn temperature(&self) -> Result<f32> {
        let raw: Vec<f32> = self.neg_log_tau.to_vec1()?;
        Ok((-raw[0]).exp())
    }
}

impl CaptioningModel for DualEncoder {
    fn calculate_ce_loss(
        &self,
        tokens: &Tensor,
        _lengths: &Tensor,
        _outputs: Option<&Tensor>,
        image_features: Option<&Tensor>,
    ) -> Result<CaptionCe> {
        let batch = tokens.dim(0)?;
        let prefix = if self.config.captioning {
            let features = match image_features {
                Some(f) => f,
                None => bail!("image-conditioned decoding requires image features"),
            };
            self.utterances.prefix_from_features(features)?
        } else {
            self.utterances.start_prefix(batch)?
        };
        let logits = self.utterances.decode(tokens, &prefix)?;
        let per_token_ce = tokenwise_cross_entropy(&logits, tokens)?;
        Ok(CaptionCe {
            per_token_ce,
            labels: tokens.clone(),
        })
    }

    fn captioning(&self) -> bool {
        self.config.captioning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{TOK_EOS, TOK_PAD, TOK_SOS};

    fn tiny_model() -> Result<(DualEncoder, Device)> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let model = DualEncoder::new(ModelConfig::tiny(), &varmap, &device)?;
        Ok((model, device))
    }

    fn tiny_batch(device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let cfg = ModelConfig::tiny();
        let frames = Tensor::randn(
            0f32,
            1.0,
            (3, cfg.frame_channels, cfg.frame_size, cfg.frame_size),
            device,
        )?;
        let tokens = Tensor::from_vec(
            vec![
                TOK_SOS, 5, 6, TOK_EOS, TOK_PAD, TOK_PAD, //
                TOK_SOS, 7, TOK_EOS, TOK_PAD, TOK_PAD, TOK_PAD, //
                TOK_SOS, 8, 9, 10, TOK_EOS, TOK_PAD,
            ],
            (3, 6),
            device,
        )?;
        let lengths = Tensor::from_vec(vec![4u32, 3, 5], (3,), device)?;
        Ok((frames, tokens, lengths))
    }

    #[test]
    fn test_temperature_starts_near_standard_init() -> Result<()> {
        let (model, _device) = tiny_model()?;
        let tau = model.temperature()?;
        assert!((tau - 0.07).abs() < 1e-3, "temperature was {tau}");
        Ok(())
    }

    #[test]
    fn test_normalized_features_have_unit_norm() -> Result<()> {
        let (model, device) = tiny_model()?;
        let (frames, tokens, lengths) = tiny_batch(&device)?;
        for features in [
            model.image_features(&frames)?,
            model.text_features(&tokens, &lengths)?,
        ] {
            let norms: Vec<f32> = features.sqr()?.sum(D::Minus1)?.sqrt()?.to_vec1()?;
            for n in norms {
                assert!((n - 1.0).abs() < 1e-4, "norm was {n}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_similarity_matrices_are_transposes() -> Result<()> {
        let (model, device) = tiny_model()?;
        let (frames, tokens, lengths) = tiny_batch(&device)?;
        let (lpi, lpt) = model.similarities(&frames, &tokens, &lengths)?;
        let a: Vec<Vec<f32>> = lpi.to_vec2()?;
        let b: Vec<Vec<f32>> = lpt.to_vec2()?;
        for i in 0..3 {
            for j in 0..3 {
                assert!((a[i][j] - b[j][i]).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_contrastive_loss_is_finite_and_complete() -> Result<()> {
        let (model, device) = tiny_model()?;
        let (frames, tokens, lengths) = tiny_batch(&device)?;
        let out = model.calculate_contrastive_loss(&frames, &tokens, &lengths)?;
        let loss = out.loss.to_scalar::<f32>()?;
        assert!(loss.is_finite() && loss > 0.0);
        assert!(out.image_accuracy >= 0.0 && out.image_accuracy <= 1.0);
        assert!(out.text_accuracy >= 0.0 && out.text_accuracy <= 1.0);
        assert!(out.image_entropy.is_finite());
        assert!(out.text_entropy.is_finite());
        assert_eq!(out.logits_per_image.dims2()?, (3, 3));
        assert_eq!(out.image_features.dims2()?, (3, ModelConfig::tiny().embed_dim));
        Ok(())
    }

    #[test]
    fn test_caption_ce_covers_every_position() -> Result<()> {
        let (model, device) = tiny_model()?;
        let (frames, tokens, lengths) = tiny_batch(&device)?;
        let features = model.image_features(&frames)?;
        let ce = model.calculate_ce_loss(&tokens, &lengths, None, Some(&features))?;
        assert_eq!(ce.per_token_ce.dims2()?, (3, 6));
        assert_eq!(ce.labels.dims2()?, (3, 6));
        let values: Vec<Vec<f32>> = ce.per_token_ce.to_vec2()?;
        for row in values {
            for v in row {
                assert!(v.is_finite() && v >= 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_caption_ce_requires_features_when_conditioned() -> Result<()> {
        let (model, device) = tiny_model()?;
        let (_frames, tokens, lengths) = tiny_batch(&device)?;
        assert!(model.captioning());
        assert!(model.calculate_ce_loss(&tokens, &lengths, None, None).is_err());
        Ok(())
    }

    #[test]
    fn test_unconditioned_decoding_needs_no_features() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let mut cfg = ModelConfig::tiny();
        cfg.captioning = false;
        let model = DualEncoder::new(cfg, &varmap, &device)?;
        let (_frames, tokens, lengths) = tiny_batch(&device)?;
        let ce = model.calculate_ce_loss(&tokens, &lengths, None, None)?;
        assert_eq!(ce.per_token_ce.dims2()?, (3, 6));
        Ok(())
    }

    #[test]
    fn test_serde_config_round_trip() -> Result<()> {
        let cfg = ModelConfig::tiny();
        let json = serde_json::to_string(&cfg)?;
        let back: ModelConfig = serde_json::from_str(&json)?;
        assert_eq!(back.embed_dim, cfg.embed_dim);
        assert_eq!(back.captioning, cfg.captioning);
        Ok(())
    }
}
