//! Building blocks shared by the denoising networks and the latent decoder.
use tch::{nn, nn::Module, Device, Kind, Tensor};

fn conv3x3(vs: nn::Path, in_channels: i64, out_channels: i64, stride: i64) -> nn::Conv2D {
    let config = nn::ConvConfig { stride, padding: 1, ..Default::default() };
    nn::conv2d(vs, in_channels, out_channels, 3, config)
}

pub(crate) fn conv1x1(vs: nn::Path, in_channels: i64, out_channels: i64) -> nn::Conv2D {
    nn::conv2d(vs, in_channels, out_channels, 1, Default::default())
}

pub(crate) fn group_norm(vs: nn::Path, channels: i64, eps: f64) -> nn::GroupNorm {
    let config = nn::GroupNormConfig { eps, affine: true, ..Default::default() };
    nn::group_norm(vs, 32, channels, config)
}

/// Sinusoidal timestep features followed by a two layer MLP, cosines first.
#[derive(Debug)]
pub(crate) struct TimeEmbedding {
    channels: i64,
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimeEmbedding {
    pub fn new(vs: nn::Path, channels: i64, embed_dim: i64) -> Self {
        let linear_1 = nn::linear(&vs / "linear_1", channels, embed_dim, Default::default());
        let linear_2 = nn::linear(&vs / "linear_2", embed_dim, embed_dim, Default::default());
        Self { channels, linear_1, linear_2 }
    }

    pub fn forward(&self, timestep: f64, bsize: i64, device: Device) -> Tensor {
        let half = self.channels / 2;
        let freqs = (Tensor::arange(half, (Kind::Float, device)) * (-f64::ln(10000.) / half as f64))
            .exp()
            .unsqueeze(0);
        let args = Tensor::full([bsize, 1], timestep, (Kind::Float, device)) * freqs;
        Tensor::cat(&[args.cos(), args.sin()], -1)
            .apply(&self.linear_1)
            .silu()
            .apply(&self.linear_2)
    }
}

/// Two normalized 3x3 convolutions with an optional timestep modulation and
/// a residual connection.
#[derive(Debug)]
pub(crate) struct ResBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    time_emb_proj: Option<nn::Linear>,
    conv_shortcut: Option<nn::Conv2D>,
}

impl ResBlock {
    pub fn new(
        vs: nn::Path,
        in_channels: i64,
        out_channels: i64,
        temb_channels: Option<i64>,
        eps: f64,
    ) -> Self {
        let conv_shortcut = (in_channels != out_channels)
            .then(|| conv1x1(&vs / "conv_shortcut", in_channels, out_channels));
        let time_emb_proj = temb_channels
            .map(|c| nn::linear(&vs / "time_emb_proj", c, out_channels, Default::default()));
        Self {
            norm1: group_norm(&vs / "norm1", in_channels, eps),
            conv1: conv3x3(&vs / "conv1", in_channels, out_channels, 1),
            norm2: group_norm(&vs / "norm2", out_channels, eps),
            conv2: conv3x3(&vs / "conv2", out_channels, out_channels, 1),
            time_emb_proj,
            conv_shortcut,
        }
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Tensor {
        let residual = match &self.conv_shortcut {
            Some(conv) => xs.apply(conv),
            None => xs.shallow_clone(),
        };
        let mut h = xs.apply(&self.norm1).silu().apply(&self.conv1);
        if let (Some(temb), Some(proj)) = (temb, &self.time_emb_proj) {
            h = h + temb.silu().apply(proj).unsqueeze(-1).unsqueeze(-1);
        }
        residual + h.apply(&self.norm2).silu().apply(&self.conv2)
    }
}

/// Stride 2 convolution.
#[derive(Debug)]
pub(crate) struct Downsample {
    conv: nn::Conv2D,
}

impl Downsample {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        Self { conv: conv3x3(&vs / "conv", channels, channels, 2) }
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }
}

/// Nearest neighbour upsampling followed by a 3x3 convolution.
#[derive(Debug)]
pub(crate) struct Upsample {
    conv: nn::Conv2D,
}

impl Upsample {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        Self { conv: conv3x3(&vs / "conv", channels, channels, 1) }
    }

    /// Doubles the spatial size unless an explicit `(height, width)` is given.
    pub fn forward(&self, xs: &Tensor, size: Option<(i64, i64)>) -> Tensor {
        let (h, w) = size.unwrap_or_else(|| {
            let s = xs.size();
            (2 * s[2], 2 * s[3])
        });
        xs.upsample_nearest2d([h, w], None, None).apply(&self.conv)
    }
}

#[derive(Debug)]
struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    heads: i64,
    scale: f64,
    slice_size: Option<i64>,
}

impl CrossAttention {
    fn new(
        vs: nn::Path,
        query_dim: i64,
        context_dim: i64,
        heads: i64,
        slice_size: Option<i64>,
    ) -> Self {
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let head_dim = query_dim / heads;
        Self {
            to_q: nn::linear(&vs / "to_q", query_dim, query_dim, no_bias),
            to_k: nn::linear(&vs / "to_k", context_dim, query_dim, no_bias),
            to_v: nn::linear(&vs / "to_v", context_dim, query_dim, no_bias),
            to_out: nn::linear(&vs / "to_out" / 0, query_dim, query_dim, Default::default()),
            heads,
            scale: 1. / (head_dim as f64).sqrt(),
            slice_size,
        }
    }

    // (b, n, h * d) -> (b * h, n, d)
    fn split_heads(&self, xs: &Tensor) -> Tensor {
        let s = xs.size();
        xs.reshape([s[0], s[1], self.heads, s[2] / self.heads])
            .permute([0, 2, 1, 3])
            .reshape([s[0] * self.heads, s[1], s[2] / self.heads])
    }

    // (b * h, n, d) -> (b, n, h * d)
    fn merge_heads(&self, xs: &Tensor) -> Tensor {
        let s = xs.size();
        xs.reshape([s[0] / self.heads, self.heads, s[1], s[2]])
            .permute([0, 2, 1, 3])
            .reshape([s[0] / self.heads, s[1], s[2] * self.heads])
    }

    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Tensor {
        q.matmul(&(k.transpose(-1, -2) * self.scale)).softmax(-1, Kind::Float).matmul(v)
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Tensor {
        let context = context.unwrap_or(xs);
        let q = self.split_heads(&xs.apply(&self.to_q));
        let k = self.split_heads(&context.apply(&self.to_k));
        let v = self.split_heads(&context.apply(&self.to_v));
        let out = match self.slice_size {
            // Processes a few heads at a time to bound the size of the
            // attention matrix.
            Some(size) if size > 0 && q.size()[0] > size => {
                let slices: Vec<Tensor> = q
                    .split(size, 0)
                    .iter()
                    .zip(k.split(size, 0).iter())
                    .zip(v.split(size, 0).iter())
                    .map(|((q, k), v)| self.attend(q, k, v))
                    .collect();
                Tensor::cat(&slices, 0)
            }
            _ => self.attend(&q, &k, &v),
        };
        self.merge_heads(&out).apply(&self.to_out)
    }
}

// GEGLU projection followed by the output layer.
#[derive(Debug)]
struct FeedForward {
    proj: nn::Linear,
    out: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::Path, dim: i64) -> Self {
        let inner = 4 * dim;
        let vs = &vs / "net";
        Self {
            proj: nn::linear(&vs / 0 / "proj", dim, 2 * inner, Default::default()),
            out: nn::linear(&vs / 2, inner, dim, Default::default()),
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let chunks = xs.apply(&self.proj).chunk(2, -1);
        (&chunks[0] * chunks[1].gelu("none")).apply(&self.out)
    }
}

#[derive(Debug)]
struct TransformerBlock {
    norm1: nn::LayerNorm,
    attn1: CrossAttention,
    norm2: nn::LayerNorm,
    attn2: CrossAttention,
    norm3: nn::LayerNorm,
    ff: FeedForward,
}

impl TransformerBlock {
    fn new(vs: nn::Path, dim: i64, heads: i64, context_dim: i64, slice: Option<i64>) -> Self {
        let norm = |name: &str| nn::layer_norm(&vs / name, vec![dim], Default::default());
        Self {
            norm1: norm("norm1"),
            attn1: CrossAttention::new(&vs / "attn1", dim, dim, heads, slice),
            norm2: norm("norm2"),
            attn2: CrossAttention::new(&vs / "attn2", dim, context_dim, heads, slice),
            norm3: norm("norm3"),
            ff: FeedForward::new(&vs / "ff", dim),
        }
    }

    fn forward(&self, xs: &Tensor, context: &Tensor) -> Tensor {
        let xs = self.attn1.forward(&xs.apply(&self.norm1), None) + xs;
        let xs = self.attn2.forward(&xs.apply(&self.norm2), Some(context)) + xs;
        xs.apply(&self.norm3).apply(&self.ff) + xs
    }
}

#[derive(Debug)]
enum Projection {
    Conv(nn::Conv2D),
    Linear(nn::Linear),
}

/// Options of the attention layers conditioned on the text embeddings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttentionConfig {
    pub heads: i64,
    pub context_dim: i64,
    pub slice_size: Option<i64>,
    pub use_linear_projection: bool,
}

/// Self attention and cross attention over the spatial positions of a
/// feature map.
#[derive(Debug)]
pub(crate) struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Projection,
    block: TransformerBlock,
    proj_out: Projection,
}

impl SpatialTransformer {
    pub fn new(vs: nn::Path, channels: i64, config: AttentionConfig) -> Self {
        let projection = |name: &str| {
            if config.use_linear_projection {
                Projection::Linear(nn::linear(&vs / name, channels, channels, Default::default()))
            } else {
                Projection::Conv(conv1x1(&vs / name, channels, channels))
            }
        };
        let block = TransformerBlock::new(
            &vs / "transformer_blocks" / 0,
            channels,
            config.heads,
            config.context_dim,
            config.slice_size,
        );
        Self {
            norm: group_norm(&vs / "norm", channels, 1e-6),
            proj_in: projection("proj_in"),
            block,
            proj_out: projection("proj_out"),
        }
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Tensor {
        let s = xs.size();
        let (b, c, h, w) = (s[0], s[1], s[2], s[3]);
        let to_seq = |xs: Tensor| xs.permute([0, 2, 3, 1]).reshape([b, h * w, c]);
        let to_map = |xs: Tensor| xs.reshape([b, h, w, c]).permute([0, 3, 1, 2]);
        let hs = xs.apply(&self.norm);
        let hs = match &self.proj_in {
            Projection::Conv(p) => to_seq(hs.apply(p)),
            Projection::Linear(p) => to_seq(hs).apply(p),
        };
        let hs = self.block.forward(&hs, context);
        let hs = match &self.proj_out {
            Projection::Conv(p) => to_map(hs).apply(p),
            Projection::Linear(p) => to_map(hs.apply(p)),
        };
        hs + xs
    }
}

/// Single head self attention used in the middle of the latent decoder.
#[derive(Debug)]
pub(crate) struct SelfAttention {
    group_norm: nn::GroupNorm,
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    proj_attn: nn::Linear,
}

impl SelfAttention {
    pub fn new(vs: nn::Path, channels: i64) -> Self {
        let linear = |name: &str| nn::linear(&vs / name, channels, channels, Default::default());
        Self {
            group_norm: group_norm(&vs / "group_norm", channels, 1e-6),
            query: linear("query"),
            key: linear("key"),
            value: linear("value"),
            proj_attn: linear("proj_attn"),
        }
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let s = xs.size();
        let (b, c, h, w) = (s[0], s[1], s[2], s[3]);
        let hs = xs.apply(&self.group_norm).reshape([b, c, h * w]).transpose(1, 2);
        let q = hs.apply(&self.query);
        let k = hs.apply(&self.key);
        let v = hs.apply(&self.value);
        let weights = (q.matmul(&k.transpose(1, 2)) / (c as f64).sqrt()).softmax(-1, Kind::Float);
        let hs = weights.matmul(&v).apply(&self.proj_attn).transpose(1, 2).reshape([b, c, h, w]);
        hs + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_embedding_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedding = TimeEmbedding::new(vs.root() / "time_embedding", 32, 128);
        let emb = embedding.forward(951., 2, Device::Cpu);
        assert_eq!(emb.size(), [2, 128]);
        let names: Vec<_> = vs.variables().into_keys().collect();
        assert!(names.contains(&"time_embedding.linear_1.weight".to_string()));
    }

    #[test]
    fn sliced_attention_matches_full_attention() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config =
            AttentionConfig { heads: 4, context_dim: 16, slice_size: None, use_linear_projection: false };
        let full = SpatialTransformer::new(vs.root() / "attn", 64, config);
        let mut sliced_vs = nn::VarStore::new(Device::Cpu);
        let sliced = SpatialTransformer::new(
            sliced_vs.root() / "attn",
            64,
            AttentionConfig { slice_size: Some(2), ..config },
        );
        sliced_vs.copy(&vs).unwrap();
        let xs = Tensor::randn([2, 64, 4, 4], tch::kind::FLOAT_CPU);
        let context = Tensor::randn([2, 7, 16], tch::kind::FLOAT_CPU);
        let diff = (full.forward(&xs, &context) - sliced.forward(&xs, &context)).abs().max();
        assert!(diff.double_value(&[]) < 1e-4);
    }

    #[test]
    fn up_and_down_sampling() {
        let vs = nn::VarStore::new(Device::Cpu);
        let down = Downsample::new(vs.root() / "down", 32);
        let up = Upsample::new(vs.root() / "up", 32);
        let xs = Tensor::randn([1, 32, 8, 6], tch::kind::FLOAT_CPU);
        let ys = xs.apply(&down);
        assert_eq!(ys.size(), [1, 32, 4, 3]);
        assert_eq!(up.forward(&ys, None).size(), [1, 32, 8, 6]);
        assert_eq!(up.forward(&ys, Some((7, 5))).size(), [1, 32, 7, 5]);
    }
}
