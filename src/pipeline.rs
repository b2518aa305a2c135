//! # Generation pipelines
//!
//! A [`Pipeline`] turns a prompt and a control image into a generated image.
//! The Torch implementation composes the shared Stable Diffusion v1.5
//! [`BaseModel`] with one ControlNet and samples with DDIM and
//! classifier-free guidance.
use crate::assets::BaseAssets;
use crate::diffusion::clip::{TextEncoder, TextEncoderConfig, Tokenizer};
use crate::diffusion::controlnet::ControlNet;
use crate::diffusion::ddim::DdimScheduler;
use crate::diffusion::unet::{UNet, UNetConfig};
use crate::diffusion::vae::{DecoderConfig, LatentDecoder};
use crate::error::{Error, Result};
use crate::utils::{self, DeviceSetup};
use image::RgbImage;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::rc::Rc;
use tch::{nn, Device, Kind, Tensor};

/// Strength applied to the ControlNet residuals.
const CONDITIONING_SCALE: f64 = 1.;

/// Everything needed to produce one image.
#[derive(Debug, Clone, Copy)]
pub struct PipelineInput<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    /// The control image, whose dimensions are those of the output.
    pub control: &'a RgbImage,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Seeds the initial noise, identical inputs and seeds give identical
    /// images.
    pub seed: i64,
}

pub trait Pipeline {
    fn run(&self, input: &PipelineInput<'_>) -> Result<RgbImage>;
}

fn load_weights<T>(path: &Path, device: Device, build: impl FnOnce(nn::Path) -> T) -> Result<T> {
    utils::file_open(path)?;
    let mut vs = nn::VarStore::new(device);
    let model = build(vs.root());
    vs.load(path)?;
    Ok(model)
}

/// Runs `f`, reporting Torch panics (shape mismatches, out of memory...) as
/// generation errors.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "torch panicked".to_string()
            };
            Err(Error::Generation(message))
        }
    }
}

/// The Stable Diffusion v1.5 networks shared by every ControlNet pipeline.
pub struct BaseModel {
    tokenizer: Tokenizer,
    text_encoder: TextEncoder,
    unet: UNet,
    decoder: LatentDecoder,
    clip_device: Device,
    unet_device: Device,
    vae_device: Device,
}

impl BaseModel {
    pub fn load(
        assets: &BaseAssets,
        devices: &DeviceSetup,
        sliced_attention_size: Option<i64>,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&assets.vocab.path)?;
        log::info!("Building the Clip transformer.");
        let text_encoder = load_weights(&assets.clip.path, devices.get("clip"), |vs| {
            TextEncoder::new(vs, &TextEncoderConfig::default())
        })?;
        log::info!("Building the autoencoder.");
        let decoder = load_weights(&assets.vae.path, devices.get("vae"), |vs| {
            LatentDecoder::new(vs, &DecoderConfig::default())
        })?;
        log::info!("Building the unet.");
        let config = UNetConfig { sliced_attention_size, ..Default::default() };
        let unet =
            load_weights(&assets.unet.path, devices.get("unet"), |vs| UNet::new(vs, 4, 4, &config))?;
        Ok(Self::from_parts(tokenizer, text_encoder, unet, decoder, devices))
    }

    /// Assembles already built networks, each of them living on the device
    /// `devices` assigns to it.
    pub fn from_parts(
        tokenizer: Tokenizer,
        text_encoder: TextEncoder,
        unet: UNet,
        decoder: LatentDecoder,
        devices: &DeviceSetup,
    ) -> Self {
        Self {
            tokenizer,
            text_encoder,
            unet,
            decoder,
            clip_device: devices.get("clip"),
            unet_device: devices.get("unet"),
            vae_device: devices.get("vae"),
        }
    }

    /// The device ControlNets have to live on.
    pub fn unet_device(&self) -> Device {
        self.unet_device
    }

    // Unconditional embeddings first, then the conditional ones.
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str) -> Tensor {
        let embed = |text: &str| {
            let tokens = self.tokenizer.encode(text);
            let tokens = Tensor::from_slice(&tokens).view((1, -1)).to(self.clip_device);
            self.text_encoder.forward(&tokens)
        };
        Tensor::cat(&[embed(negative_prompt), embed(prompt)], 0).to(self.unet_device)
    }

    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        let image = self.decoder.decode(&latents.to(self.vae_device));
        let image = (image / 2 + 0.5).clamp(0., 1.).to_device(Device::Cpu);
        let image = (image * 255.).to_kind(Kind::Uint8);
        utils::tensor_to_image(&image)
    }
}

/// The base model steered by one ControlNet.
pub struct ControlNetPipeline {
    base: Rc<BaseModel>,
    controlnet: ControlNet,
}

impl ControlNetPipeline {
    pub fn new(base: Rc<BaseModel>, controlnet: ControlNet) -> Self {
        Self { base, controlnet }
    }

    fn sample(&self, input: &PipelineInput<'_>) -> Result<RgbImage> {
        let (width, height) = input.control.dimensions();
        if width % 8 != 0 || height % 8 != 0 {
            return Err(Error::InvalidRequest(format!(
                "control image size {width}x{height} is not a multiple of 8"
            )));
        }
        let device = self.base.unet_device;
        let scheduler = DdimScheduler::new(input.steps);
        let hint = utils::image_to_tensor(input.control)?.to_kind(Kind::Float) / 255.;
        let hint = Tensor::cat(&[&hint, &hint], 0).to_device(device);
        let text_embeddings = self.base.text_embeddings(input.prompt, input.negative_prompt);

        tch::manual_seed(input.seed);
        let mut latents =
            Tensor::randn([1, 4, height as i64 / 8, width as i64 / 8], (Kind::Float, device));
        latents *= scheduler.init_noise_sigma();

        let n_steps = scheduler.timesteps().len();
        for (timestep_index, &timestep) in scheduler.timesteps().iter().enumerate() {
            log::debug!("Timestep {}/{n_steps}", timestep_index + 1);
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0);
            let residuals = self.controlnet.forward(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                &hint,
                CONDITIONING_SCALE,
            );
            let noise_pred = self.base.unet.forward(
                &latent_model_input,
                timestep as f64,
                &text_embeddings,
                Some(&residuals),
            );
            let noise_pred = noise_pred.chunk(2, 0);
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * input.guidance_scale;
            latents = scheduler.step(&noise_pred, timestep, &latents);
        }
        log::info!("Generating the final {width}x{height} image.");
        self.base.decode(&latents)
    }
}

impl Pipeline for ControlNetPipeline {
    fn run(&self, input: &PipelineInput<'_>) -> Result<RgbImage> {
        guarded(|| tch::no_grad(|| self.sample(input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::controlnet::ControlNetConfig;
    use crate::diffusion::unet::tests::tiny_config;

    // Randomly initialized networks small enough to sample on the CPU, the
    // ControlNet hint encoder bringing 64x64 images down to 8x8 latents.
    fn tiny_pipeline(dir: &tempfile::TempDir) -> ControlNetPipeline {
        let vocab = dir.path().join("vocab.txt");
        std::fs::write(&vocab, "#version: 0.2\nr o\no m</w>\nro om</w>\n").unwrap();
        let tokenizer = Tokenizer::from_file(&vocab).unwrap();
        let devices = DeviceSetup::new(vec!["all".to_string()]);
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = tiny_config();
        let text_config = TextEncoderConfig {
            embed_dim: backbone.cross_attention_dim,
            intermediate_size: 16,
            num_layers: 1,
            num_heads: 2,
            ..Default::default()
        };
        let text_encoder = TextEncoder::new(vs.root() / "clip", &text_config);
        let unet = UNet::new(vs.root() / "unet", 4, 4, &backbone);
        let decoder_config =
            DecoderConfig { block_out_channels: vec![32, 32, 64, 64], ..Default::default() };
        let decoder = LatentDecoder::new(vs.root() / "vae", &decoder_config);
        let config =
            ControlNetConfig { backbone, conditioning_embedding_out_channels: vec![4, 8, 8, 16] };
        let controlnet = ControlNet::new(vs.root() / "controlnet", 4, &config);
        let base = BaseModel::from_parts(tokenizer, text_encoder, unet, decoder, &devices);
        ControlNetPipeline::new(Rc::new(base), controlnet)
    }

    #[test]
    fn sampling_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = tiny_pipeline(&dir);
        let control = crate::diagnostics::synthetic_room(64);
        let input = PipelineInput {
            prompt: "a room",
            negative_prompt: "",
            control: &control,
            steps: 2,
            guidance_scale: 7.5,
            seed: 42,
        };
        let first = pipeline.run(&input).unwrap();
        assert_eq!(first.dimensions(), (64, 64));
        let second = pipeline.run(&input).unwrap();
        assert_eq!(first, second);
        let other = pipeline.run(&PipelineInput { seed: 43, ..input }).unwrap();
        assert_eq!(other.dimensions(), (64, 64));
        assert_ne!(first, other);
    }

    #[test]
    fn control_sizes_must_fit_the_latents() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = tiny_pipeline(&dir);
        let control = RgbImage::new(60, 64);
        let input = PipelineInput {
            prompt: "",
            negative_prompt: "",
            control: &control,
            steps: 1,
            guidance_scale: 1.,
            seed: 0,
        };
        let err = pipeline.run(&input).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");
    }

    #[test]
    fn torch_panics_become_generation_errors() {
        let err = guarded(|| {
            let a = Tensor::ones([2, 3], tch::kind::FLOAT_CPU);
            let b = Tensor::ones([2, 3], tch::kind::FLOAT_CPU);
            Ok(a.matmul(&b))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Generation(_)), "{err:?}");
        let value = guarded(|| Ok(3)).unwrap();
        assert_eq!(value, 3);
        let err = guarded::<()>(|| Err(Error::InvalidRequest("steps".to_string()))).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn missing_weights_are_reported() {
        let err = load_weights(Path::new("/no/such/unet.safetensors"), Device::Cpu, |vs| {
            nn::linear(vs / "proj", 2, 2, Default::default())
        })
        .unwrap_err();
        assert!(err.to_string().contains("unet.safetensors"), "{err}");
    }

    #[test]
    fn weights_round_trip_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proj.safetensors");
        let vs = nn::VarStore::new(Device::Cpu);
        let original = nn::linear(vs.root() / "proj", 2, 3, Default::default());
        vs.save(&path).unwrap();
        let loaded = load_weights(&path, Device::Cpu, |vs| {
            nn::linear(vs / "proj", 2, 3, Default::default())
        })
        .unwrap();
        assert_eq!(loaded.ws, original.ws);
    }
}
