use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use candle_transformers::generation::LogitsProcessor;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{GenerationParameters, LanguageModel};

const END_OF_TEXT: &str = "<|endoftext|>";

// ---------------------------------------------------------
// Config (HF `config.json` for the GPT-2 family)
// ---------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

// ---------------------------------------------------------
// Snapshot files
// ---------------------------------------------------------
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Local snapshot: single `model.safetensors` or an index with shards.
    pub fn from_dir(snapshot_dir: &Path) -> Result<Self> {
        let single = snapshot_dir.join("model.safetensors");
        let weights = if single.exists() {
            vec![single]
        } else {
            let index_path = snapshot_dir.join("model.safetensors.index.json");
            let index_json: serde_json::Value = serde_json::from_slice(
                &fs::read(&index_path)
                    .with_context(|| format!("no weights found in {}", snapshot_dir.display()))?,
            )?;

            let mut shards = index_json["weight_map"]
                .as_object()
                .ok_or_else(|| anyhow!("index.json: weight_map is not an object"))?
                .values()
                .map(|v| {
                    let file = v
                        .as_str()
                        .ok_or_else(|| anyhow!("invalid shard entry in index.json"))?;
                    Ok(snapshot_dir.join(file))
                })
                .collect::<Result<Vec<_>>>()?;
            shards.sort();
            shards.dedup();
            shards
        };

        Ok(Self {
            config: snapshot_dir.join("config.json"),
            tokenizer: snapshot_dir.join("tokenizer.json"),
            weights,
        })
    }

    /// Resolves (and caches) the snapshot through the Hugging Face hub.
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new().context("failed to initialise hf-hub client")?;
        let repo = api.model(model_id.to_string());
        let fetch = |file: &str| {
            repo.get(file)
                .with_context(|| format!("failed to fetch {file} for {model_id}"))
        };

        Ok(Self {
            config: fetch("config.json")?,
            tokenizer: fetch("tokenizer.json")?,
            weights: vec![fetch("model.safetensors")?],
        })
    }
}

// ---------------------------------------------------------
// Model
// ---------------------------------------------------------

/// HF `Conv1D`: a linear layer whose weight is stored as (in, out).
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle::Result<Self> {
        let weight = vb.get((in_dim, out_dim), "weight")?;
        let bias = vb.get(out_dim, "bias")?;
        Ok(Self { weight, bias })
    }
}

impl Module for Conv1D {
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        xs.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}

struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    n_head: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            c_attn: Conv1D::load(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?,
            c_proj: Conv1D::load(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
            n_head: cfg.n_head,
            head_dim: cfg.n_embd / cfg.n_head,
            kv_cache: None,
        })
    }

    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> candle::Result<Tensor> {
        xs.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> candle::Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;

        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, c)?, b, t)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, c, c)?, b, t)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * c, c)?, b, t)?;

        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let scale = 1f64 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let scores = match mask {
            Some(mask) => masked_fill(
                &scores,
                &mask.broadcast_as(scores.dims())?,
                f32::NEG_INFINITY,
            )?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let ys = weights.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.c_proj.forward(&ys)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl Mlp {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            c_fc: Conv1D::load(cfg.n_embd, 4 * cfg.n_embd, vb.pp("c_fc"))?,
            c_proj: Conv1D::load(4 * cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        // gelu_new (tanh approximation)
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>) -> candle::Result<Tensor> {
        let xs = (self.attn.forward(&self.ln_1.forward(xs)?, mask)? + xs)?;
        let ys = self.mlp.forward(&self.ln_2.forward(&xs)?)?;
        ys + xs
    }
}

pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
}

impl Gpt2 {
    pub fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle::Result<Self> {
        // LM-head checkpoints nest the body under `transformer.`
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(cfg, vb.pp(format!("h.{i}"))))
            .collect::<candle::Result<Vec<_>>>()?;

        Ok(Self {
            wte: embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?,
            wpe: embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?,
        })
    }

    /// `input_ids` is (batch, seq); `pos` is the number of positions already
    /// held in the KV cache. Returns logits for the last position only:
    /// (batch, 1, vocab).
    pub fn forward(&mut self, input_ids: &Tensor, pos: usize) -> candle::Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        let device = input_ids.device();

        let positions = Tensor::arange(pos as u32, (pos + t) as u32, device)?;
        let mut xs = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        let mask = if t > 1 {
            Some(causal_mask(t, pos, device)?)
        } else {
            None
        };

        for block in self.blocks.iter_mut() {
            xs = block.forward(&xs, mask.as_ref())?;
        }

        let last = self.ln_f.forward(&xs.narrow(1, t - 1, 1)?.contiguous()?)?;
        // Tied LM head.
        last.broadcast_matmul(&self.wte.embeddings().t()?)
    }

    pub fn clear_kv_cache(&mut self) {
        for block in self.blocks.iter_mut() {
            block.attn.kv_cache = None;
        }
    }
}

fn causal_mask(t: usize, offset: usize, device: &Device) -> candle::Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t + offset).map(move |j| u8::from(j > i + offset)))
        .collect();
    Tensor::from_slice(&mask, (t, t + offset), device)
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle::Result<Tensor> {
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(mask.dims())?;
    mask.where_cond(&on_true, on_false)
}

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct Gpt2Service {
    model: Mutex<Gpt2>,
    tokenizer: Tokenizer,
    device: Device,
    eos: Option<u32>,
    max_context: usize,
}

impl Gpt2Service {
    pub fn new_with(files: &ModelFiles, device: Device) -> Result<Self> {
        info!(device = ?device, config = %files.config.display(), "loading gpt2 snapshot");

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;
        let eos = tokenizer.token_to_id(END_OF_TEXT);

        let cfg: Gpt2Config = serde_json::from_slice(
            &fs::read(&files.config)
                .with_context(|| format!("failed to read {}", files.config.display()))?,
        )?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, DType::F32, &device)? };
        let model = Gpt2::load(&cfg, vb)?;

        info!(
            layers = cfg.n_layer,
            heads = cfg.n_head,
            n_positions = cfg.n_positions,
            shards = files.weights.len(),
            "gpt2 loaded"
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            eos,
            max_context: cfg.n_positions,
        })
    }
}

impl LanguageModel for Gpt2Service {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn generate(&self, tokens: &[u32], params: &GenerationParameters) -> Result<Vec<u32>> {
        if tokens.is_empty() {
            return Err(anyhow!("cannot generate from an empty prompt"));
        }

        // Held for the whole sampling loop: the KV cache is per-call state.
        // A poisoned lock is safe to reuse because the cache is reset first.
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        model.clear_kv_cache();

        let mut sampler = LogitsProcessor::new(
            params.resolve_seed(),
            params.sampling_temperature(),
            params.sampling_top_p(),
        );

        let started = Instant::now();
        let mut output = tokens.to_vec();
        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            if pos >= self.max_context {
                break;
            }

            let ctx: &[u32] = if pos == 0 {
                &output
            } else {
                &output[output.len() - 1..]
            };
            let ctx_len = ctx.len();
            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;

            let logits = model.forward(&input, pos)?;
            let seq_len = logits.dim(1)?;
            let logits = logits.i((0, seq_len - 1))?.to_dtype(DType::F32)?;

            pos += ctx_len;

            let next = sampler.sample(&logits)?;
            if Some(next) == self.eos {
                break;
            }
            output.push(next);
        }

        debug!(
            prompt_tokens = tokens.len(),
            new_tokens = output.len() - tokens.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gpt2 sampling finished"
        );

        Ok(output)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;
        Ok(text.replace(END_OF_TEXT, ""))
    }

    fn max_context(&self) -> usize {
        self.max_context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_blocks_future_positions() {
        let mask = causal_mask(3, 0, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<u8>().unwrap();
        assert_eq!(rows, vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]);
    }

    #[test]
    fn causal_mask_respects_cached_offset() {
        let mask = causal_mask(2, 2, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<u8>().unwrap();
        assert_eq!(rows, vec![vec![0, 0, 0, 1], vec![0, 0, 0, 0]]);
    }

    #[test]
    fn masked_fill_replaces_flagged_entries() {
        let scores = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0u8, 1], [0, 0]], &Device::Cpu).unwrap();
        let filled = masked_fill(&scores, &mask, f32::NEG_INFINITY)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(filled[0][0], 1.);
        assert!(filled[0][1].is_infinite());
        assert_eq!(filled[1], vec![3., 4.]);
    }

    #[test]
    fn config_defaults_layer_norm_epsilon() {
        let cfg: Gpt2Config = serde_json::from_str(
            r#"{"vocab_size":50257,"n_positions":1024,"n_embd":768,"n_layer":6,"n_head":12}"#,
        )
        .unwrap();
        assert_eq!(cfg.n_layer, 6);
        assert_eq!(cfg.layer_norm_epsilon, 1e-5);
    }

    #[test]
    fn snapshot_dir_prefers_single_safetensors() {
        let dir = std::env::temp_dir().join(format!("gpt2-snapshot-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("model.safetensors"), b"").unwrap();

        let files = ModelFiles::from_dir(&dir).unwrap();
        assert_eq!(files.weights, vec![dir.join("model.safetensors")]);
        assert_eq!(files.tokenizer, dir.join("tokenizer.json"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn snapshot_dir_collects_indexed_shards() {
        let dir = std::env::temp_dir().join(format!("gpt2-shards-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{"weight_map":{"a":"part-2.safetensors","b":"part-1.safetensors","c":"part-1.safetensors"}}"#,
        )
        .unwrap();

        let files = ModelFiles::from_dir(&dir).unwrap();
        assert_eq!(
            files.weights,
            vec![dir.join("part-1.safetensors"), dir.join("part-2.safetensors")]
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
