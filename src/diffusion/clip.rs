//! # CLIP text encoder
//!
//! Byte-pair tokenizer and transformer turning prompts into the embeddings
//! the UNet cross-attends to, configured as the ViT-L/14 text tower used by
//! Stable Diffusion v1.5.
//!
//! https://github.com/openai/CLIP
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Every prompt is padded or truncated to this many tokens.
pub const MAX_TOKENS: usize = 77;
// The vocabulary has 49152 entries: 2 * 256 byte tokens, the merges and the
// start/end markers.
const MAX_MERGES: usize = 49152 - 256 - 2;

const PAT: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

fn is_printable(b: u32) -> bool {
    (33..=126).contains(&b) || (161..=172).contains(&b) || b >= 174
}

/// The printable characters standing for each byte, in vocabulary order.
fn byte_symbols() -> Vec<char> {
    let mut symbols: Vec<char> =
        (0..256u32).filter(|&b| is_printable(b)).filter_map(char::from_u32).collect();
    let others = (0..256u32).filter(|&b| !is_printable(b)).count() as u32;
    symbols.extend((256..256 + others).filter_map(char::from_u32));
    symbols
}

/// The symbol of each byte, indexed by the byte value. Printable bytes stand
/// for themselves, the others are shifted past 255 in increasing order.
fn byte_encoder() -> Vec<char> {
    let mut shifted = 255;
    (0..256u32)
        .map(|b| {
            if is_printable(b) {
                b
            } else {
                shifted += 1;
                shifted
            }
        })
        .filter_map(char::from_u32)
        .collect()
}

/// Byte-pair encoding tokenizer reading the `bpe_simple_vocab_16e6.txt`
/// merges file.
pub struct Tokenizer {
    re: Regex,
    byte_encoder: Vec<char>,
    encoder: HashMap<String, i64>,
    bpe_ranks: HashMap<(String, String), usize>,
    start_of_text: i64,
    end_of_text: i64,
}

impl Tokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = std::io::BufReader::new(crate::utils::file_open(path)?);
        let mut merges = vec![];
        // The first line is a version header.
        for line in reader.lines().skip(1).take(MAX_MERGES) {
            let line = line?;
            match line.split_whitespace().collect::<Vec<_>>().as_slice() {
                [first, second] => merges.push((first.to_string(), second.to_string())),
                _ => return Err(Error::Config(format!("invalid bpe merge '{line}'"))),
            }
        }
        let symbols = byte_symbols();
        let mut vocab: Vec<String> = symbols.iter().map(|c| c.to_string()).collect();
        vocab.extend(symbols.iter().map(|c| format!("{c}</w>")));
        vocab.extend(merges.iter().map(|(a, b)| format!("{a}{b}")));
        vocab.push("<|startoftext|>".to_string());
        vocab.push("<|endoftext|>".to_string());
        let start_of_text = vocab.len() as i64 - 2;
        let encoder: HashMap<String, i64> =
            vocab.into_iter().enumerate().map(|(i, v)| (v, i as i64)).collect();
        let bpe_ranks = merges.into_iter().enumerate().map(|(i, m)| (m, i)).collect();
        let re = Regex::new(PAT).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            re,
            byte_encoder: byte_encoder(),
            encoder,
            bpe_ranks,
            start_of_text,
            end_of_text: start_of_text + 1,
        })
    }

    fn bpe(&self, token: &str) -> Vec<i64> {
        // The vocabulary works on the UTF-8 bytes, each one spelled as its symbol.
        let mut word: Vec<String> =
            token.bytes().map(|b| self.byte_encoder[b as usize].to_string()).collect();
        match word.last_mut() {
            Some(last) => last.push_str("</w>"),
            None => return vec![],
        }
        while word.len() > 1 {
            let best = word
                .windows(2)
                .filter_map(|w| {
                    let pair = (w[0].clone(), w[1].clone());
                    self.bpe_ranks.get(&pair).map(|&rank| (rank, pair))
                })
                .min_by_key(|(rank, _)| *rank);
            let Some((_, (first, second))) = best else { break };
            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
        }
        word.iter().filter_map(|w| self.encoder.get(w)).copied().collect()
    }

    /// Lower-cases and tokenizes `text`, framed by the start and end markers
    /// and padded with end markers to [`MAX_TOKENS`]. Long prompts are
    /// truncated, keeping the end marker.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let text = text.to_lowercase();
        let mut tokens = vec![self.start_of_text];
        for m in self.re.find_iter(&text) {
            tokens.extend(self.bpe(m.as_str()));
        }
        tokens.truncate(MAX_TOKENS - 1);
        tokens.resize(MAX_TOKENS, self.end_of_text);
        tokens
    }
}

/// Sizes of the text transformer.
#[derive(Debug, Clone)]
pub struct TextEncoderConfig {
    pub vocab_size: i64,
    pub embed_dim: i64,
    pub intermediate_size: i64,
    pub num_layers: i64,
    pub num_heads: i64,
}

impl Default for TextEncoderConfig {
    /// The ViT-L/14 text tower.
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            intermediate_size: 3072,
            num_layers: 12,
            num_heads: 12,
        }
    }
}

#[derive(Debug)]
struct Attention {
    num_heads: i64,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl Attention {
    fn new(vs: nn::Path, config: &TextEncoderConfig) -> Self {
        let dim = config.embed_dim;
        let linear = |name: &str| nn::linear(&vs / name, dim, dim, Default::default());
        Self {
            num_heads: config.num_heads,
            q_proj: linear("q_proj"),
            k_proj: linear("k_proj"),
            v_proj: linear("v_proj"),
            out_proj: linear("out_proj"),
        }
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Tensor {
        let s = xs.size();
        let (b, n, dim) = (s[0], s[1], s[2]);
        let head_dim = dim / self.num_heads;
        let heads = |xs: Tensor| xs.reshape([b, n, self.num_heads, head_dim]).transpose(1, 2);
        let q = heads(xs.apply(&self.q_proj) * (head_dim as f64).powf(-0.5));
        let k = heads(xs.apply(&self.k_proj));
        let v = heads(xs.apply(&self.v_proj));
        let weights = (q.matmul(&k.transpose(-1, -2)) + mask).softmax(-1, Kind::Float);
        weights.matmul(&v).transpose(1, 2).reshape([b, n, dim]).apply(&self.out_proj)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    layer_norm1: nn::LayerNorm,
    self_attn: Attention,
    layer_norm2: nn::LayerNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl EncoderLayer {
    fn new(vs: nn::Path, config: &TextEncoderConfig) -> Self {
        let (dim, hidden) = (config.embed_dim, config.intermediate_size);
        let norm = |name: &str| nn::layer_norm(&vs / name, vec![dim], Default::default());
        let mlp = &vs / "mlp";
        Self {
            layer_norm1: norm("layer_norm1"),
            self_attn: Attention::new(&vs / "self_attn", config),
            layer_norm2: norm("layer_norm2"),
            fc1: nn::linear(&mlp / "fc1", dim, hidden, Default::default()),
            fc2: nn::linear(&mlp / "fc2", hidden, dim, Default::default()),
        }
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Tensor {
        let xs = self.self_attn.forward(&xs.apply(&self.layer_norm1), mask) + xs;
        let hs = xs.apply(&self.layer_norm2).apply(&self.fc1);
        // quick_gelu
        let hs = (&hs * (&hs * 1.702).sigmoid()).apply(&self.fc2);
        hs + xs
    }
}

/// The CLIP text transformer, producing one embedding per token.
#[derive(Debug)]
pub struct TextEncoder {
    token_embedding: nn::Embedding,
    position_embedding: nn::Embedding,
    layers: Vec<EncoderLayer>,
    final_layer_norm: nn::LayerNorm,
}

impl TextEncoder {
    pub fn new(vs: nn::Path, config: &TextEncoderConfig) -> Self {
        let vs = &vs / "text_model";
        let embeddings = &vs / "embeddings";
        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::new(&vs / "encoder" / "layers" / i, config));
        Self {
            token_embedding: nn::embedding(
                &embeddings / "token_embedding",
                config.vocab_size,
                config.embed_dim,
                Default::default(),
            ),
            position_embedding: nn::embedding(
                &embeddings / "position_embedding",
                MAX_TOKENS as i64,
                config.embed_dim,
                Default::default(),
            ),
            layers: layers.collect(),
            final_layer_norm: nn::layer_norm(
                &vs / "final_layer_norm",
                vec![config.embed_dim],
                Default::default(),
            ),
        }
    }

    // Each position only attends to itself and the ones before.
    fn causal_mask(n: i64, device: Device) -> Tensor {
        Tensor::full([n, n], f32::MIN as f64, (Kind::Float, device)).triu(1)
    }

    /// Embeddings of shape `(batch, tokens, embed_dim)` for `(batch, tokens)` ids.
    pub fn forward(&self, tokens: &Tensor) -> Tensor {
        let n = tokens.size()[1];
        let positions = Tensor::arange(n, (Kind::Int64, tokens.device())).unsqueeze(0);
        let mut xs = tokens.apply(&self.token_embedding) + positions.apply(&self.position_embedding);
        let mask = Self::causal_mask(n, tokens.device());
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, &mask);
        }
        xs.apply(&self.final_layer_norm)
    }
}
