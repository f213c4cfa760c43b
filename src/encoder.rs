// Frame and utterance encoders. The frame side is a small convolutional
// patch network; the utterance side is a causal transformer that serves
// both as a pooled text encoder and, given a one-slot prefix, as an
// image-conditioned decoder.
//
// Normalization and attention softmax are composed from primitive ops so
// the backward pass is complete; the fused candle_nn kernels do not
// propagate gradients through all of their inputs.

use anyhow::{ensure, Result};
use candle_core::{Module, Tensor, D};
use candle_nn::{
    conv2d, embedding, linear, linear_no_bias, Conv2d, Conv2dConfig, Embedding, Init, Linear,
    VarBuilder,
};

use crate::model::ModelConfig;

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        Ok(RmsNorm { weight, eps: 1e-6 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight).map_err(Into::into)
    }
}

fn stable_softmax(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exps = x.broadcast_sub(&max)?.exp()?;
    let sum = exps.sum_keepdim(D::Minus1)?;
    exps.broadcast_div(&sum).map_err(Into::into)
}

fn causal_mask(seq_len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device).map_err(Into::into)
}

struct Attention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        Ok(Attention {
            q: linear_no_bias(d, d, vb.pp("q"))?,
            k: linear_no_bias(d, d, vb.pp("k"))?,
            v: linear_no_bias(d, d, vb.pp("v"))?,
            o: linear_no_bias(d, d, vb.pp("o"))?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, d) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, s, self.n_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
                .map_err(Into::into)
        };
        let q = split(self.q.forward(x)?)?;
        let k = split(self.k.forward(x)?)?;
        let v = split(self.v.forward(x)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?;
        let scores = scores.broadcast_add(&causal_mask(s, x.device())?)?;
        let weights = stable_softmax(&scores)?;
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, d))?;
        self.o.forward(&context).map_err(Into::into)
    }
}

struct Mlp {
    gate: Linear,
    down: Linear,
}

impl Mlp {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Mlp {
            gate: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("gate"))?,
            down: linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("down"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.gate.forward(x)?.gelu()?;
        self.down.forward(&hidden).map_err(Into::into)
    }
}

struct Block {
    attn_norm: RmsNorm,
    attn: Attention,
    mlp_norm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Block {
            attn_norm: RmsNorm::new(cfg.d_model, vb.pp("attn_norm"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            mlp_norm: RmsNorm::new(cfg.d_model, vb.pp("mlp_norm"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.attn_norm.forward(x)?)?)?;
        let x = (&x + self.mlp.forward(&self.mlp_norm.forward(&x)?)?)?;
        Ok(x)
    }
}

// ---------------------------------------------------------------------------
// Frame encoder
// ---------------------------------------------------------------------------

/// Convolutional encoder for video frames. Frames are cut into
/// non-overlapping patches, refined by one 3x3 layer, projected into the
/// shared embedding space, and either kept spatial (for alignment maps) or
/// mean-pooled into one global feature per frame.
pub struct FrameEncoder {
    patch: Conv2d,
    conv: Conv2d,
    proj: Linear,
}

impl FrameEncoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(
            cfg.frame_size % cfg.patch_size == 0,
            "frame size {} is not divisible by patch size {}",
            cfg.frame_size,
            cfg.patch_size
        );
        let patch = conv2d(
            cfg.frame_channels,
            cfg.conv_channels,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb.pp("patch"),
        )?;
        let conv = conv2d(
            cfg.conv_channels,
            cfg.conv_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let proj = linear(cfg.conv_channels, cfg.embed_dim, vb.pp("proj"))?;
        Ok(FrameEncoder { patch, conv, proj })
    }

    fn trunk(&self, frames: &Tensor) -> Result<Tensor> {
        let x = self.patch.forward(frames)?.gelu()?;
        self.conv.forward(&x)?.gelu().map_err(Into::into)
    }

    /// Per-patch features in the shared embedding space,
    /// `(batch, embed, grid, grid)`.
    pub fn spatial_features(&self, frames: &Tensor) -> Result<Tensor> {
        let x = self.trunk(frames)?;
        let (b, c, h, w) = x.dims4()?;
        let flat = x.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let projected = self.proj.forward(&flat)?;
        let e = projected.dim(2)?;
        projected
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, e, h, w))
            .map_err(Into::into)
    }

    /// One global feature per frame, `(batch, embed)`.
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        self.spatial_features(frames)?
            .mean(D::Minus1)?
            .mean(D::Minus1)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Utterance encoder
// ---------------------------------------------------------------------------

/// Causal transformer over token ids with learned positions. Three uses:
/// `pooled` gives one feature per utterance for contrastive alignment,
/// `decode` scores every token of a sequence conditioned on a one-slot
/// prefix, and `embed_words` exposes per-token shared-space embeddings.
pub struct UtteranceEncoder {
    tok_emb: Embedding,
    pos_emb: Embedding,
    blocks: Vec<Block>,
    final_norm: RmsNorm,
    lm_head: Linear,
    pool_proj: Linear,
    prefix_proj: Linear,
    start_emb: Tensor,
}

impl UtteranceEncoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(
            cfg.d_model % cfg.n_heads == 0,
            "d_model {} is not divisible by {} heads",
            cfg.d_model,
            cfg.n_heads
        );
        let tok_emb = embedding(cfg.vocab_size, cfg.d_model, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.max_len, cfg.d_model, vb.pp("pos_emb"))?;
        let mut blocks = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            blocks.push(Block::new(cfg, vb.pp(format!("block_{i}")))?);
        }
        let final_norm = RmsNorm::new(cfg.d_model, vb.pp("final_norm"))?;
        let lm_head = linear_no_bias(cfg.d_model, cfg.vocab_size, vb.pp("lm_head"))?;
        let pool_proj = linear(cfg.d_model, cfg.embed_dim, vb.pp("pool_proj"))?;
        let prefix_proj = linear(cfg.embed_dim, cfg.d_model, vb.pp("prefix_proj"))?;
        let start_emb = vb.get_with_hints(
            (1, 1, cfg.d_model),
            "start_emb",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(UtteranceEncoder {
            tok_emb,
            pos_emb,
            blocks,
            final_norm,
            lm_head,
            pool_proj,
            prefix_proj,
            start_emb,
        })
    }

    fn add_positions(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let positions = Tensor::arange(0u32, seq_len as u32, x.device())?;
        x.broadcast_add(&self.pos_emb.forward(&positions)?)
            .map_err(Into::into)
    }

    fn hidden(&self, mut x: Tensor) -> Result<Tensor> {
        x = self.add_positions(&x)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.final_norm.forward(&x)
    }

    /// One feature per utterance, `(batch, embed)`: hidden states averaged
    /// over real (unpadded) positions, then projected into the shared space.
    pub fn pooled(&self, tokens: &Tensor, lengths: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden(self.tok_emb.forward(tokens)?)?;
        let (batch, seq, _d) = hidden.dims3()?;
        let lens: Vec<u32> = lengths.to_vec1()?;
        ensure!(
            lens.len() == batch,
            "got {} lengths for a batch of {}",
            lens.len(),
            batch
        );
        let mut mask = vec![0f32; batch * seq];
        let mut denom = vec![0f32; batch];
        for (i, &len) in lens.iter().enumerate() {
            let len = len as usize;
            ensure!(len >= 1 && len <= seq, "length {} outside 1..={}", len, seq);
            for j in 0..len {
                mask[i * seq + j] = 1.0;
            }
            denom[i] = len as f32;
        }
        let mask = Tensor::from_vec(mask, (batch, seq, 1), hidden.device())?;
        let denom = Tensor::from_vec(denom, (batch, 1), hidden.device())?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let mean = summed.broadcast_div(&denom)?;
        self.pool_proj.forward(&mean).map_err(Into::into)
    }

    /// Logits for every position of `tokens`, conditioned on a one-slot
    /// prefix: the input sequence is `[prefix, emb(tokens[..seq-1])]`, so
    /// row i predicts `tokens[i]` and row 0 is predicted from the prefix
    /// alone.
    pub fn decode(&self, tokens: &Tensor, prefix: &Tensor) -> Result<Tensor> {
        let (batch, seq) = tokens.dims2()?;
        ensure!(seq >= 1, "cannot decode an empty sequence");
        let (pb, ps, _pd) = prefix.dims3()?;
        ensure!(
            pb == batch && ps == 1,
            "prefix {:?} does not fit batch {}",
            prefix.shape(),
            batch
        );
        let x = if seq > 1 {
            let shifted = self.tok_emb.forward(&tokens.narrow(1, 0, seq - 1)?)?;
            Tensor::cat(&[prefix, &shifted], 1)?
        } else {
            prefix.clone()
        };
        let hidden = self.hidden(x)?;
        self.lm_head.forward(&hidden).map_err(Into::into)
    }

    /// Projects global image features into a decoder prefix slot,
    /// `(batch, 1, d_model)`.
    pub fn prefix_from_features(&self, features: &Tensor) -> Result<Tensor> {
        self.prefix_proj
            .forward(features)?
            .unsqueeze(1)
            .map_err(Into::into)
    }

    /// Learned start prefix for unconditioned decoding.
    pub fn start_prefix(&self, batch: usize) -> Result<Tensor> {
        let copies = vec![&self.start_emb; batch];
        Tensor::cat(&copies, 0).map_err(Into::into)
    }

    /// Per-token embeddings in the shared space, `(batch, seq, embed)`.
    /// Context-free: these are table lookups, not transformer outputs.
    pub fn embed_words(&self, tokens: &Tensor) -> Result<Tensor> {
        self.pool_proj
            .forward(&self.tok_emb.forward(tokens)?)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn builders() -> (ModelConfig, VarMap, VarBuilder<'static>) {
        let cfg = ModelConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (cfg, varmap, vb)
    }

    #[test]
    fn test_frame_encoder_shapes() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = FrameEncoder::new(&cfg, vb)?;
        let frames = Tensor::randn(
            0f32,
            1.0,
            (2, cfg.frame_channels, cfg.frame_size, cfg.frame_size),
            &Device::Cpu,
        )?;
        let grid = cfg.frame_size / cfg.patch_size;
        let spatial = enc.spatial_features(&frames)?;
        assert_eq!(spatial.dims4()?, (2, cfg.embed_dim, grid, grid));
        let global = enc.forward(&frames)?;
        assert_eq!(global.dims2()?, (2, cfg.embed_dim));
        Ok(())
    }

    #[test]
    fn test_global_feature_is_mean_of_spatial() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = FrameEncoder::new(&cfg, vb)?;
        let frames = Tensor::randn(
            0f32,
            1.0,
            (1, cfg.frame_channels, cfg.frame_size, cfg.frame_size),
            &Device::Cpu,
        )?;
        let global: Vec<Vec<f32>> = enc.forward(&frames)?.to_vec2()?;
        let spatial = enc.spatial_features(&frames)?;
        let manual: Vec<Vec<f32>> = spatial.mean(D::Minus1)?.mean(D::Minus1)?.to_vec2()?;
        for (a, b) in global[0].iter().zip(&manual[0]) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_pooled_ignores_padding() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = UtteranceEncoder::new(&cfg, vb)?;
        let device = Device::Cpu;
        // Same real tokens, different padding tails.
        let a = Tensor::from_vec(vec![2u32, 5, 3, 0, 0, 0], (1, 6), &device)?;
        let b = Tensor::from_vec(vec![2u32, 5, 3, 0, 0, 0], (1, 6), &device)?;
        let lengths = Tensor::from_vec(vec![3u32], (1,), &device)?;
        let fa: Vec<Vec<f32>> = enc.pooled(&a, &lengths)?.to_vec2()?;
        let fb: Vec<Vec<f32>> = enc.pooled(&b, &lengths)?.to_vec2()?;
        assert_eq!(fa[0].len(), cfg.embed_dim);
        for (x, y) in fa[0].iter().zip(&fb[0]) {
            assert!((x - y).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_pooled_rejects_bad_lengths() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = UtteranceEncoder::new(&cfg, vb)?;
        let device = Device::Cpu;
        let tokens = Tensor::from_vec(vec![2u32, 5, 3, 0], (1, 4), &device)?;
        let too_long = Tensor::from_vec(vec![9u32], (1,), &device)?;
        assert!(enc.pooled(&tokens, &too_long).is_err());
        Ok(())
    }

    #[test]
    fn test_decode_shapes_with_both_prefixes() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = UtteranceEncoder::new(&cfg, vb)?;
        let device = Device::Cpu;
        let tokens = Tensor::from_vec(vec![2u32, 5, 6, 3, 2, 7, 3, 0], (2, 4), &device)?;

        let start = enc.start_prefix(2)?;
        assert_eq!(start.dims3()?, (2, 1, cfg.d_model));
        let logits = enc.decode(&tokens, &start)?;
        assert_eq!(logits.dims3()?, (2, 4, cfg.vocab_size));

        let features = Tensor::randn(0f32, 1.0, (2, cfg.embed_dim), &device)?;
        let prefix = enc.prefix_from_features(&features)?;
        assert_eq!(prefix.dims3()?, (2, 1, cfg.d_model));
        let logits = enc.decode(&tokens, &prefix)?;
        assert_eq!(logits.dims3()?, (2, 4, cfg.vocab_size));
        Ok(())
    }

    #[test]
    fn test_decode_position_zero_sees_only_prefix() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = UtteranceEncoder::new(&cfg, vb)?;
        let device = Device::Cpu;
        // Two sequences with the same prefix but different tokens: position 0
        // logits must match because the first token is not an input there.
        let a = Tensor::from_vec(vec![2u32, 5, 6, 3], (1, 4), &device)?;
        let b = Tensor::from_vec(vec![3u32, 7, 8, 2], (1, 4), &device)?;
        let prefix = enc.start_prefix(1)?;
        let la: Vec<Vec<Vec<f32>>> = enc.decode(&a, &prefix)?.to_vec3()?;
        let lb: Vec<Vec<Vec<f32>>> = enc.decode(&b, &prefix)?.to_vec3()?;
        for (x, y) in la[0][0].iter().zip(&lb[0][0]) {
            assert!((x - y).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_embed_words_shape() -> anyhow::Result<()> {
        let (cfg, _varmap, vb) = builders();
        let enc = UtteranceEncoder::new(&cfg, vb)?;
        let tokens = Tensor::from_vec(vec![2u32, 5, 3], (1, 3), &Device::Cpu)?;
        let embs = enc.embed_words(&tokens)?;
        assert_eq!(embs.dims3()?, (1, 3, cfg.embed_dim));
        Ok(())
    }
}
