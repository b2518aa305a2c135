//! # ControlNet
//!
//! A trainable copy of the UNet contracting half that encodes a control
//! image (edges, depth, normals...) into residuals for the frozen UNet.
use super::layers::conv1x1;
use super::unet::{ControlResiduals, DownOutput, DownPath, UNetConfig};
use tch::{nn, nn::Module, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct ControlNetConfig {
    /// Layout of the duplicated UNet blocks.
    pub backbone: UNetConfig,
    /// Channels of the control image encoder, each transition halving the
    /// resolution.
    pub conditioning_embedding_out_channels: Vec<i64>,
}

impl Default for ControlNetConfig {
    // https://huggingface.co/lllyasviel/sd-controlnet-canny/blob/main/config.json
    fn default() -> Self {
        Self {
            backbone: UNetConfig::default(),
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
        }
    }
}

// Brings the control image down to the latent resolution.
#[derive(Debug)]
struct HintEncoder {
    conv_in: nn::Conv2D,
    blocks: Vec<(nn::Conv2D, nn::Conv2D)>,
    conv_out: nn::Conv2D,
}

impl HintEncoder {
    fn new(vs: nn::Path, channels: &[i64], out_channels: i64) -> Self {
        let same = nn::ConvConfig { padding: 1, ..Default::default() };
        let strided = nn::ConvConfig { stride: 2, padding: 1, ..Default::default() };
        let first = channels.first().copied().unwrap_or(out_channels);
        let last = channels.last().copied().unwrap_or(out_channels);
        let blocks = channels
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (c_in, c_out) = (pair[0], pair[1]);
                let vs = &vs / "blocks";
                (
                    nn::conv2d(&vs / (2 * i), c_in, c_in, 3, same),
                    nn::conv2d(&vs / (2 * i + 1), c_in, c_out, 3, strided),
                )
            })
            .collect();
        Self {
            conv_in: nn::conv2d(&vs / "conv_in", 3, first, 3, same),
            blocks,
            conv_out: nn::conv2d(&vs / "conv_out", last, out_channels, 3, same),
        }
    }
}

impl Module for HintEncoder {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.apply(&self.conv_in).silu();
        for (c1, c2) in self.blocks.iter() {
            xs = xs.apply(c1).silu().apply(c2).silu();
        }
        xs.apply(&self.conv_out)
    }
}

#[derive(Debug)]
pub struct ControlNet {
    down: DownPath,
    controlnet_cond_embedding: HintEncoder,
    controlnet_down_blocks: Vec<nn::Conv2D>,
    controlnet_mid_block: nn::Conv2D,
}

impl ControlNet {
    pub fn new(vs: nn::Path, in_channels: i64, config: &ControlNetConfig) -> Self {
        let backbone = &config.backbone;
        let down = DownPath::new(&vs, in_channels, backbone);
        let b_channels = backbone.blocks[0].out_channels;
        let controlnet_cond_embedding = HintEncoder::new(
            &vs / "controlnet_cond_embedding",
            &config.conditioning_embedding_out_channels,
            b_channels,
        );
        // One zero convolution per skip connection of the UNet.
        let mut skip_channels = vec![b_channels];
        for (i, block) in backbone.blocks.iter().enumerate() {
            let n = backbone.layers_per_block as usize + usize::from(i + 1 < backbone.blocks.len());
            skip_channels.extend(std::iter::repeat(block.out_channels).take(n));
        }
        let vs_c = &vs / "controlnet_down_blocks";
        let controlnet_down_blocks =
            skip_channels.iter().enumerate().map(|(i, &c)| conv1x1(&vs_c / i, c, c)).collect();
        let mid = backbone.blocks[backbone.blocks.len() - 1].out_channels;
        let controlnet_mid_block = conv1x1(&vs / "controlnet_mid_block", mid, mid);
        Self { down, controlnet_cond_embedding, controlnet_down_blocks, controlnet_mid_block }
    }

    /// Residuals for the UNet, `cond` being the control image in `[0, 1]`
    /// with the same batch size as `xs` and 8 times its resolution.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        context: &Tensor,
        cond: &Tensor,
        conditioning_scale: f64,
    ) -> ControlResiduals {
        let hint = cond.apply(&self.controlnet_cond_embedding);
        let DownOutput { xs, skips, .. } = self.down.forward(xs, timestep, context, Some(&hint));
        let down = skips
            .iter()
            .zip(self.controlnet_down_blocks.iter())
            .map(|(skip, conv)| skip.apply(conv) * conditioning_scale)
            .collect();
        let mid = xs.apply(&self.controlnet_mid_block) * conditioning_scale;
        ControlResiduals { down, mid }
    }
}
