//! # Conditional UNet
//!
//! Predicts the noise in a latent sample given the timestep and the text
//! embeddings. The contracting half is shared with the ControlNet, which
//! produces residuals added to the skip connections and to the middle
//! block output.
use super::layers::{
    group_norm, AttentionConfig, Downsample, ResBlock, SpatialTransformer, TimeEmbedding, Upsample,
};
use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub out_channels: i64,
    pub use_cross_attn: bool,
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UNetConfig {
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: i64,
    pub cross_attention_dim: i64,
    pub use_linear_projection: bool,
    /// The size of the sliced attention or 0 for automatic slicing.
    pub sliced_attention_size: Option<i64>,
    pub norm_eps: f64,
}

impl Default for UNetConfig {
    // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
    fn default() -> Self {
        let block = |out_channels, use_cross_attn| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim: 8,
        };
        Self {
            blocks: vec![block(320, true), block(640, true), block(1280, true), block(1280, false)],
            layers_per_block: 2,
            cross_attention_dim: 768,
            use_linear_projection: false,
            sliced_attention_size: None,
            norm_eps: 1e-5,
        }
    }
}

impl UNetConfig {
    fn attention(&self, heads: i64) -> AttentionConfig {
        let slice_size = match self.sliced_attention_size {
            Some(0) => Some(heads / 2),
            size => size,
        };
        AttentionConfig {
            heads,
            context_dim: self.cross_attention_dim,
            slice_size,
            use_linear_projection: self.use_linear_projection,
        }
    }

    fn time_embed_dim(&self) -> i64 {
        4 * self.blocks[0].out_channels
    }
}

/// Residuals produced by a ControlNet, one per skip connection plus one for
/// the middle block.
#[derive(Debug)]
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

#[derive(Debug)]
struct DownBlock {
    resnets: Vec<ResBlock>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample>,
}

impl DownBlock {
    fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> (Tensor, Vec<Tensor>) {
        let mut xs = xs.shallow_clone();
        let mut skips = vec![];
        for (index, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(index) {
                xs = attn.forward(&xs, context);
            }
            skips.push(xs.shallow_clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = xs.apply(downsampler);
            skips.push(xs.shallow_clone());
        }
        (xs, skips)
    }
}

#[derive(Debug)]
struct MidBlock {
    resnet_in: ResBlock,
    attention: SpatialTransformer,
    resnet_out: ResBlock,
}

impl MidBlock {
    fn new(vs: nn::Path, channels: i64, config: &UNetConfig, heads: i64) -> Self {
        let temb = Some(config.time_embed_dim());
        let resnet = |i: i64| {
            ResBlock::new(&vs / "resnets" / i, channels, channels, temb, config.norm_eps)
        };
        Self {
            resnet_in: resnet(0),
            attention: SpatialTransformer::new(
                &vs / "attentions" / 0,
                channels,
                config.attention(heads),
            ),
            resnet_out: resnet(1),
        }
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Tensor {
        let xs = self.resnet_in.forward(xs, Some(temb));
        let xs = self.attention.forward(&xs, context);
        self.resnet_out.forward(&xs, Some(temb))
    }
}

/// Everything up to the middle block: the part a ControlNet duplicates.
#[derive(Debug)]
pub(crate) struct DownPath {
    conv_in: nn::Conv2D,
    time_embedding: TimeEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
}

pub(crate) struct DownOutput {
    pub xs: Tensor,
    pub temb: Tensor,
    pub skips: Vec<Tensor>,
}

impl DownPath {
    pub fn new(vs: &nn::Path, in_channels: i64, config: &UNetConfig) -> Self {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let temb = config.time_embed_dim();
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(vs / "conv_in", in_channels, b_channels, 3, conv_cfg);
        let time_embedding = TimeEmbedding::new(vs / "time_embedding", b_channels, temb);
        let down_blocks = config
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let vs = vs / "down_blocks" / i;
                let in_channels = if i == 0 { b_channels } else { config.blocks[i - 1].out_channels };
                let out = block.out_channels;
                let resnets = (0..config.layers_per_block)
                    .map(|j| {
                        let in_channels = if j == 0 { in_channels } else { out };
                        ResBlock::new(&vs / "resnets" / j, in_channels, out, Some(temb), config.norm_eps)
                    })
                    .collect();
                let attentions = if block.use_cross_attn {
                    let attention = config.attention(block.attention_head_dim);
                    (0..config.layers_per_block)
                        .map(|j| SpatialTransformer::new(&vs / "attentions" / j, out, attention))
                        .collect()
                } else {
                    vec![]
                };
                let downsampler = (i + 1 < n_blocks)
                    .then(|| Downsample::new(&vs / "downsamplers" / 0, out));
                DownBlock { resnets, attentions, downsampler }
            })
            .collect();
        let last = config.blocks[n_blocks - 1];
        let mid_block =
            MidBlock::new(vs / "mid_block", last.out_channels, config, last.attention_head_dim);
        Self { conv_in, time_embedding, down_blocks, mid_block }
    }

    /// `hint` is added to the features right after the input convolution.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
        hint: Option<&Tensor>,
    ) -> DownOutput {
        let temb = self.time_embedding.forward(timestep, xs.size()[0], xs.device());
        let mut xs = xs.apply(&self.conv_in);
        if let Some(hint) = hint {
            xs = xs + hint;
        }
        let mut skips = vec![xs.shallow_clone()];
        for block in self.down_blocks.iter() {
            let (ys, block_skips) = block.forward(&xs, &temb, context);
            skips.extend(block_skips);
            xs = ys;
        }
        let xs = self.mid_block.forward(&xs, &temb, context);
        DownOutput { xs, temb, skips }
    }
}

#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResBlock>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample>,
}

impl UpBlock {
    fn forward(
        &self,
        xs: &Tensor,
        mut skips: Vec<Tensor>,
        temb: &Tensor,
        context: &Tensor,
        upsample_size: Option<(i64, i64)>,
    ) -> Tensor {
        let mut xs = xs.shallow_clone();
        for (index, resnet) in self.resnets.iter().enumerate() {
            if let Some(skip) = skips.pop() {
                xs = Tensor::cat(&[&xs, &skip], 1);
            }
            xs = resnet.forward(&xs, Some(temb));
            if let Some(attn) = self.attentions.get(index) {
                xs = attn.forward(&xs, context);
            }
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(&xs, upsample_size),
            None => xs,
        }
    }
}

#[derive(Debug)]
pub struct UNet {
    down: DownPath,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
}

impl UNet {
    pub fn new(vs: nn::Path, in_channels: i64, out_channels: i64, config: &UNetConfig) -> Self {
        let down = DownPath::new(&vs, in_channels, config);
        let blocks = &config.blocks;
        let n_blocks = blocks.len();
        let temb = config.time_embed_dim();
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let vs = &vs / "up_blocks" / i;
                let block = blocks[n_blocks - 1 - i];
                let out = block.out_channels;
                let prev_out = blocks[n_blocks - i.max(1)].out_channels;
                let skip_in = blocks[(n_blocks - 1 - i).saturating_sub(1)].out_channels;
                let n_layers = config.layers_per_block + 1;
                let resnets = (0..n_layers)
                    .map(|j| {
                        let skip = if j == n_layers - 1 { skip_in } else { out };
                        let in_channels = if j == 0 { prev_out } else { out };
                        ResBlock::new(
                            &vs / "resnets" / j,
                            in_channels + skip,
                            out,
                            Some(temb),
                            config.norm_eps,
                        )
                    })
                    .collect();
                let attentions = if block.use_cross_attn {
                    let attention = config.attention(block.attention_head_dim);
                    (0..n_layers)
                        .map(|j| SpatialTransformer::new(&vs / "attentions" / j, out, attention))
                        .collect()
                } else {
                    vec![]
                };
                let upsampler =
                    (i + 1 < n_blocks).then(|| Upsample::new(&vs / "upsamplers" / 0, out));
                UpBlock { resnets, attentions, upsampler }
            })
            .collect();
        let b_channels = blocks[0].out_channels;
        let conv_norm_out = group_norm(&vs / "conv_norm_out", b_channels, config.norm_eps);
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, out_channels, 3, conv_cfg);
        Self { down, up_blocks, conv_norm_out, conv_out }
    }

    /// Predicts the noise in `xs`, optionally steered by ControlNet residuals.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
        residuals: Option<&ControlResiduals>,
    ) -> Tensor {
        let DownOutput { mut xs, temb, mut skips } = self.down.forward(xs, timestep, context, None);
        if let Some(residuals) = residuals {
            skips = skips.iter().zip(residuals.down.iter()).map(|(s, r)| s + r).collect();
            xs = xs + &residuals.mid;
        }
        for block in self.up_blocks.iter() {
            let block_skips = skips.split_off(skips.len().saturating_sub(block.resnets.len()));
            // Upsample to the size of the next skip connection so that odd
            // sizes survive the round trip.
            let upsample_size = skips.last().map(|s| {
                let s = s.size();
                (s[2], s[3])
            });
            xs = block.forward(&xs, block_skips, &temb, context, upsample_size);
        }
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}
