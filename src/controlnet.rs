//! # ControlNet v1.1 loading
//!
//! The v1.1 releases ship as checkpoints in the original (ldm) layout with
//! a YAML model description. This module maps both onto the diffusers
//! parameter layout of [`ControlNet`].
use crate::assets::ControlAssets;
use crate::checkpoint;
use crate::diffusion::controlnet::{ControlNet, ControlNetConfig};
use crate::diffusion::unet::{BlockConfig, UNetConfig};
use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tch::{nn, Device, Tensor};

#[derive(Debug, Deserialize)]
struct YamlFile {
    model: YamlModel,
}

#[derive(Debug, Deserialize)]
struct YamlModel {
    params: YamlModelParams,
}

#[derive(Debug, Deserialize)]
struct YamlModelParams {
    control_stage_config: YamlStage,
}

#[derive(Debug, Deserialize)]
struct YamlStage {
    params: ControlNetParams,
}

/// The `control_stage_config` parameters of a ControlNet YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlNetParams {
    #[serde(default = "default_in_channels")]
    pub in_channels: i64,
    #[serde(default = "default_hint_channels")]
    pub hint_channels: i64,
    pub model_channels: i64,
    pub attention_resolutions: Vec<i64>,
    pub num_res_blocks: i64,
    pub channel_mult: Vec<i64>,
    #[serde(default = "default_num_heads")]
    pub num_heads: i64,
    #[serde(default = "default_transformer_depth")]
    pub transformer_depth: i64,
    pub context_dim: i64,
    #[serde(default)]
    pub use_linear_in_transformer: bool,
}

fn default_in_channels() -> i64 {
    4
}

fn default_hint_channels() -> i64 {
    3
}

fn default_num_heads() -> i64 {
    8
}

fn default_transformer_depth() -> i64 {
    1
}

impl ControlNetParams {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: YamlFile =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("controlnet yaml: {e}")))?;
        Ok(file.model.params.control_stage_config.params)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut yaml = String::new();
        std::io::Read::read_to_string(&mut crate::utils::file_open(path)?, &mut yaml)?;
        Self::from_yaml(&yaml)
    }

    /// The equivalent network configuration.
    pub fn to_config(&self) -> Result<ControlNetConfig> {
        if self.hint_channels != 3 {
            return Err(Error::Config(format!(
                "only rgb hints are supported, got {} hint channels",
                self.hint_channels
            )));
        }
        if self.transformer_depth != 1 {
            return Err(Error::Config(format!(
                "unsupported transformer depth {}",
                self.transformer_depth
            )));
        }
        if self.channel_mult.is_empty() {
            return Err(Error::Config("empty channel_mult".to_string()));
        }
        // Block i works at a downsampling factor of 2^i.
        let blocks = self
            .channel_mult
            .iter()
            .enumerate()
            .map(|(i, mult)| BlockConfig {
                out_channels: self.model_channels * mult,
                use_cross_attn: self.attention_resolutions.contains(&(1 << i)),
                attention_head_dim: self.num_heads,
            })
            .collect();
        let backbone = UNetConfig {
            blocks,
            layers_per_block: self.num_res_blocks,
            cross_attention_dim: self.context_dim,
            use_linear_projection: self.use_linear_in_transformer,
            ..Default::default()
        };
        Ok(ControlNetConfig { backbone, ..Default::default() })
    }
}

/// Renames parameters from the original ControlNet layout to the diffusers
/// one, e.g. `control_model.input_blocks.1.0.in_layers.0.weight` becomes
/// `down_blocks.0.resnets.0.norm1.weight`.
pub struct KeyConverter {
    layers_per_block: usize,
    hint_convs: usize,
    input_block: Regex,
    middle_block: Regex,
    hint_block: Regex,
    zero_conv: Regex,
}

const RESNET_RENAMES: [(&str, &str); 6] = [
    ("in_layers.0.", "norm1."),
    ("in_layers.2.", "conv1."),
    ("emb_layers.1.", "time_emb_proj."),
    ("out_layers.0.", "norm2."),
    ("out_layers.3.", "conv2."),
    ("skip_connection.", "conv_shortcut."),
];

fn resnet_key(rest: &str) -> Option<String> {
    RESNET_RENAMES
        .iter()
        .find_map(|(from, to)| rest.strip_prefix(from).map(|tail| format!("{to}{tail}")))
}

impl KeyConverter {
    pub fn new(config: &ControlNetConfig) -> Result<Self> {
        let re = |s: &str| Regex::new(s).map_err(|e| Error::Config(e.to_string()));
        Ok(Self {
            layers_per_block: config.backbone.layers_per_block as usize,
            // Every channel transition in the hint encoder uses two convs.
            hint_convs: 2 * config.conditioning_embedding_out_channels.len().saturating_sub(1),
            input_block: re(r"^input_blocks\.(\d+)\.(\d+)\.(.+)$")?,
            middle_block: re(r"^middle_block\.(\d+)\.(.+)$")?,
            hint_block: re(r"^input_hint_block\.(\d+)\.(.+)$")?,
            zero_conv: re(r"^zero_convs\.(\d+)\.0\.(.+)$")?,
        })
    }

    /// The diffusers name for `key`, `None` for keys with no counterpart.
    pub fn convert(&self, key: &str) -> Option<String> {
        let key = key.strip_prefix("control_model.").unwrap_or(key);
        if let Some(rest) = key.strip_prefix("time_embed.0.") {
            return Some(format!("time_embedding.linear_1.{rest}"));
        }
        if let Some(rest) = key.strip_prefix("time_embed.2.") {
            return Some(format!("time_embedding.linear_2.{rest}"));
        }
        if let Some(rest) = key.strip_prefix("middle_block_out.0.") {
            return Some(format!("controlnet_mid_block.{rest}"));
        }
        if let Some(c) = self.zero_conv.captures(key) {
            return Some(format!("controlnet_down_blocks.{}.{}", &c[1], &c[2]));
        }
        if let Some(c) = self.hint_block.captures(key) {
            let idx: usize = c[1].parse().ok()?;
            // Odd indexes are the SiLU activations.
            if idx % 2 != 0 {
                return None;
            }
            let conv = idx / 2;
            let target = if conv == 0 {
                "conv_in".to_string()
            } else if conv == self.hint_convs + 1 {
                "conv_out".to_string()
            } else if conv <= self.hint_convs {
                format!("blocks.{}", conv - 1)
            } else {
                return None;
            };
            return Some(format!("controlnet_cond_embedding.{target}.{}", &c[2]));
        }
        if let Some(c) = self.middle_block.captures(key) {
            let rest = &c[2];
            return match &c[1] {
                "0" => resnet_key(rest).map(|r| format!("mid_block.resnets.0.{r}")),
                "1" => Some(format!("mid_block.attentions.0.{rest}")),
                "2" => resnet_key(rest).map(|r| format!("mid_block.resnets.1.{r}")),
                _ => None,
            };
        }
        if let Some(c) = self.input_block.captures(key) {
            let idx: usize = c[1].parse().ok()?;
            let rest = &c[3];
            if idx == 0 {
                return Some(format!("conv_in.{rest}"));
            }
            let block = (idx - 1) / (self.layers_per_block + 1);
            let layer = (idx - 1) % (self.layers_per_block + 1);
            return match &c[2] {
                "0" if layer == self.layers_per_block => rest
                    .strip_prefix("op.")
                    .map(|r| format!("down_blocks.{block}.downsamplers.0.conv.{r}")),
                "0" => resnet_key(rest).map(|r| format!("down_blocks.{block}.resnets.{layer}.{r}")),
                "1" => Some(format!("down_blocks.{block}.attentions.{layer}.{rest}")),
                _ => None,
            };
        }
        None
    }
}

/// Copies `tensors` into the variables of `vs`. Every variable must be
/// covered, unused tensors are ignored.
fn copy_into(vs: &nn::VarStore, mut tensors: HashMap<String, Tensor>) -> Result<()> {
    let mut variables = vs.variables();
    tch::no_grad(|| -> Result<()> {
        for (name, var) in variables.iter_mut() {
            let src = tensors
                .remove(name)
                .ok_or_else(|| Error::Checkpoint(format!("cannot find {name} in the checkpoint")))?;
            let src = if src.size() == var.size() {
                src
            } else if src.numel() == var.numel() {
                // Linear projections stored as 1x1 convolutions.
                src.f_reshape(var.size())?
            } else {
                return Err(Error::Checkpoint(format!(
                    "shape mismatch for {name}: {:?} in the checkpoint, expected {:?}",
                    src.size(),
                    var.size()
                )));
            };
            var.f_copy_(&src)?;
        }
        Ok(())
    })?;
    if !tensors.is_empty() {
        log::debug!("{} checkpoint tensors were not used", tensors.len());
    }
    Ok(())
}

/// Builds the ControlNet described by `assets` on `device`.
pub fn load(
    assets: &ControlAssets,
    device: Device,
    sliced_attention_size: Option<i64>,
) -> Result<ControlNet> {
    let params = ControlNetParams::from_file(&assets.config.path)?;
    let mut config = params.to_config()?;
    config.backbone.sliced_attention_size = sliced_attention_size;
    let converter = KeyConverter::new(&config)?;
    let tensors: HashMap<String, Tensor> = checkpoint::read_pth(&assets.weights.path)?
        .into_iter()
        .filter_map(|(key, tensor)| converter.convert(&key).map(|key| (key, tensor)))
        .collect();
    let vs = nn::VarStore::new(device);
    let controlnet = ControlNet::new(vs.root(), params.in_channels, &config);
    copy_into(&vs, tensors)?;
    log::info!("Loaded the {} controlnet from {:?}.", assets.control_type, assets.weights.path);
    Ok(controlnet)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANNY_YAML: &str = r#"
model:
  target: cldm.cldm.ControlLDM
  params:
    linear_start: 0.00085
    linear_end: 0.0120
    control_key: "hint"
    image_size: 64
    channels: 4
    only_mid_control: False

    control_stage_config:
      target: cldm.cldm.ControlNet
      params:
        use_checkpoint: True
        image_size: 32 # unused
        in_channels: 4
        hint_channels: 3
        model_channels: 320
        attention_resolutions: [ 4, 2, 1 ]
        num_res_blocks: 2
        channel_mult: [ 1, 2, 4, 4 ]
        num_heads: 8
        use_spatial_transformer: True
        transformer_depth: 1
        context_dim: 768
        legacy: False

    unet_config:
      target: cldm.cldm.ControlledUnetModel
      params:
        model_channels: 320
"#;

    fn converter() -> KeyConverter {
        let config = ControlNetParams::from_yaml(CANNY_YAML).unwrap().to_config().unwrap();
        KeyConverter::new(&config).unwrap()
    }

    #[test]
    fn parses_v11_yaml() {
        let params = ControlNetParams::from_yaml(CANNY_YAML).unwrap();
        assert_eq!(params.model_channels, 320);
        assert_eq!(params.channel_mult, [1, 2, 4, 4]);
        assert!(!params.use_linear_in_transformer);
        let config = params.to_config().unwrap();
        let backbone = &config.backbone;
        let channels: Vec<_> = backbone.blocks.iter().map(|b| b.out_channels).collect();
        assert_eq!(channels, [320, 640, 1280, 1280]);
        let cross_attn: Vec<_> = backbone.blocks.iter().map(|b| b.use_cross_attn).collect();
        assert_eq!(cross_attn, [true, true, true, false]);
        assert!(backbone.blocks.iter().all(|b| b.attention_head_dim == 8));
        assert_eq!(backbone.layers_per_block, 2);
        assert_eq!(backbone.cross_attention_dim, 768);
        assert_eq!(config, ControlNetConfig::default());
        assert_eq!(config.conditioning_embedding_out_channels, [16, 32, 96, 256]);
    }

    #[test]
    fn rejects_unsupported_configs() {
        let yaml = CANNY_YAML.replace("hint_channels: 3", "hint_channels: 1");
        let params = ControlNetParams::from_yaml(&yaml).unwrap();
        assert!(matches!(params.to_config(), Err(Error::Config(_))));
        assert!(matches!(ControlNetParams::from_yaml("model: 3"), Err(Error::Config(_))));
    }

    #[test]
    fn converts_top_level_keys() {
        let c = converter();
        let cases = [
            ("control_model.time_embed.0.weight", "time_embedding.linear_1.weight"),
            ("control_model.time_embed.2.bias", "time_embedding.linear_2.bias"),
            ("control_model.input_blocks.0.0.weight", "conv_in.weight"),
            ("control_model.zero_convs.11.0.bias", "controlnet_down_blocks.11.bias"),
            ("control_model.middle_block_out.0.weight", "controlnet_mid_block.weight"),
        ];
        for (from, to) in cases {
            assert_eq!(c.convert(from).as_deref(), Some(to), "{from}");
        }
        assert_eq!(c.convert("time_embed.0.weight").as_deref(), Some("time_embedding.linear_1.weight"));
        assert_eq!(c.convert("control_model.lvlb_weights"), None);
    }

    #[test]
    fn converts_hint_encoder() {
        let c = converter();
        let cases = [
            (0, "conv_in"),
            (2, "blocks.0"),
            (4, "blocks.1"),
            (12, "blocks.5"),
            (14, "conv_out"),
        ];
        for (idx, to) in cases {
            let key = format!("control_model.input_hint_block.{idx}.weight");
            assert_eq!(
                c.convert(&key),
                Some(format!("controlnet_cond_embedding.{to}.weight")),
                "{key}"
            );
        }
        assert_eq!(c.convert("control_model.input_hint_block.1.weight"), None);
        assert_eq!(c.convert("control_model.input_hint_block.16.weight"), None);
    }

    #[test]
    fn converts_down_and_mid_blocks() {
        let c = converter();
        let cases = [
            ("input_blocks.1.0.in_layers.0.weight", "down_blocks.0.resnets.0.norm1.weight"),
            ("input_blocks.2.0.emb_layers.1.bias", "down_blocks.0.resnets.1.time_emb_proj.bias"),
            (
                "input_blocks.2.1.transformer_blocks.0.attn1.to_q.weight",
                "down_blocks.0.attentions.1.transformer_blocks.0.attn1.to_q.weight",
            ),
            ("input_blocks.3.0.op.weight", "down_blocks.0.downsamplers.0.conv.weight"),
            ("input_blocks.4.0.skip_connection.bias", "down_blocks.1.resnets.0.conv_shortcut.bias"),
            ("input_blocks.4.1.proj_in.weight", "down_blocks.1.attentions.0.proj_in.weight"),
            ("input_blocks.9.0.op.bias", "down_blocks.2.downsamplers.0.conv.bias"),
            ("input_blocks.11.0.out_layers.3.weight", "down_blocks.3.resnets.1.conv2.weight"),
            ("middle_block.0.out_layers.0.bias", "mid_block.resnets.0.norm2.bias"),
            ("middle_block.1.norm.weight", "mid_block.attentions.0.norm.weight"),
            ("middle_block.2.in_layers.2.weight", "mid_block.resnets.1.conv1.weight"),
        ];
        for (from, to) in cases {
            let from = format!("control_model.{from}");
            assert_eq!(c.convert(&from).as_deref(), Some(to), "{from}");
        }
        assert_eq!(c.convert("control_model.input_blocks.1.0.unknown.weight"), None);
    }

    #[test]
    fn copy_reshapes_projections_and_reports_missing() {
        let vs = nn::VarStore::new(Device::Cpu);
        let proj = nn::linear(&vs.root() / "proj", 2, 2, Default::default());
        let mut tensors = HashMap::new();
        tensors.insert("proj.weight".to_string(), Tensor::ones([2, 2, 1, 1], tch::kind::FLOAT_CPU));
        tensors.insert("proj.bias".to_string(), Tensor::zeros([2], tch::kind::FLOAT_CPU));
        tensors.insert("unused".to_string(), Tensor::zeros([1], tch::kind::FLOAT_CPU));
        copy_into(&vs, tensors).unwrap();
        assert_eq!(proj.ws.sum(tch::Kind::Float).double_value(&[]), 4.);

        let mut tensors = HashMap::new();
        tensors.insert("proj.weight".to_string(), Tensor::ones([2, 2], tch::kind::FLOAT_CPU));
        let err = copy_into(&vs, tensors).unwrap_err();
        assert!(err.to_string().contains("proj.bias"));
    }
}
