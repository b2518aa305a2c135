//! # Latent decoder
//!
//! The decoding half of the Stable Diffusion variational auto-encoder,
//! mapping 4 channel latents back to RGB images 8 times larger. Encoder
//! weights present in the checkpoint are ignored.
use super::layers::{conv1x1, group_norm, ResBlock, SelfAttention, Upsample};
use tch::{nn, Tensor};

/// Latents are stored scaled by this factor.
pub const LATENT_SCALE: f64 = 0.18215;

const EPS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub block_out_channels: Vec<i64>,
    pub layers_per_block: i64,
    pub latent_channels: i64,
}

impl Default for DecoderConfig {
    // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
    fn default() -> Self {
        Self { block_out_channels: vec![128, 256, 512, 512], layers_per_block: 2, latent_channels: 4 }
    }
}

#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResBlock>,
    upsampler: Option<Upsample>,
}

#[derive(Debug)]
pub struct LatentDecoder {
    post_quant_conv: nn::Conv2D,
    conv_in: nn::Conv2D,
    mid_resnets: [ResBlock; 2],
    mid_attention: SelfAttention,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
}

impl LatentDecoder {
    pub fn new(vs: nn::Path, config: &DecoderConfig) -> Self {
        let latent = config.latent_channels;
        let channels: Vec<i64> = config.block_out_channels.iter().rev().copied().collect();
        let top = channels[0];
        let post_quant_conv = conv1x1(&vs / "post_quant_conv", latent, latent);
        let vs = &vs / "decoder";
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", latent, top, 3, conv_cfg);
        let mid = &vs / "mid_block";
        let mid_resnets = [0, 1].map(|i| ResBlock::new(&mid / "resnets" / i, top, top, None, EPS));
        let mid_attention = SelfAttention::new(&mid / "attentions" / 0, top);
        let up_blocks = channels
            .iter()
            .enumerate()
            .map(|(i, &out)| {
                let vs = &vs / "up_blocks" / i;
                let in_channels = channels[i.saturating_sub(1)];
                let resnets = (0..config.layers_per_block + 1)
                    .map(|j| {
                        let in_channels = if j == 0 { in_channels } else { out };
                        ResBlock::new(&vs / "resnets" / j, in_channels, out, None, EPS)
                    })
                    .collect();
                let upsampler = (i + 1 < channels.len())
                    .then(|| Upsample::new(&vs / "upsamplers" / 0, out));
                UpBlock { resnets, upsampler }
            })
            .collect();
        let bottom = channels[channels.len() - 1];
        let conv_norm_out = group_norm(&vs / "conv_norm_out", bottom, EPS);
        let conv_out = nn::conv2d(&vs / "conv_out", bottom, 3, 3, conv_cfg);
        Self {
            post_quant_conv,
            conv_in,
            mid_resnets,
            mid_attention,
            up_blocks,
            conv_norm_out,
            conv_out,
        }
    }

    /// Decodes scaled latents into images with values roughly in `[-1, 1]`.
    pub fn decode(&self, latents: &Tensor) -> Tensor {
        let xs = (latents / LATENT_SCALE).apply(&self.post_quant_conv).apply(&self.conv_in);
        let xs = self.mid_resnets[0].forward(&xs, None).apply(&self.mid_attention);
        let mut xs = self.mid_resnets[1].forward(&xs, None);
        for block in self.up_blocks.iter() {
            for resnet in block.resnets.iter() {
                xs = resnet.forward(&xs, None);
            }
            if let Some(upsampler) = &block.upsampler {
                xs = upsampler.forward(&xs, None);
            }
        }
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn upscales_by_eight() {
        let config = DecoderConfig { block_out_channels: vec![32, 32, 64, 64], ..Default::default() };
        let vs = nn::VarStore::new(Device::Cpu);
        let decoder = LatentDecoder::new(vs.root(), &config);
        let latents = Tensor::randn([1, 4, 3, 5], tch::kind::FLOAT_CPU);
        let image = tch::no_grad(|| decoder.decode(&latents));
        assert_eq!(image.size(), [1, 3, 24, 40]);
    }

    #[test]
    fn only_decoder_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _decoder = LatentDecoder::new(vs.root(), &DecoderConfig::default());
        let variables = vs.variables();
        for name in [
            "post_quant_conv.weight",
            "decoder.mid_block.attentions.0.query.weight",
            "decoder.mid_block.resnets.1.norm2.bias",
            "decoder.up_blocks.2.resnets.0.conv_shortcut.weight",
            "decoder.up_blocks.2.upsamplers.0.conv.weight",
            "decoder.conv_out.bias",
        ] {
            assert!(variables.contains_key(name), "{name}");
        }
        assert!(!variables.contains_key("decoder.up_blocks.3.upsamplers.0.conv.weight"));
        assert!(!variables.keys().any(|k| k.starts_with("encoder.") || k.starts_with("quant_conv")));
    }
}
