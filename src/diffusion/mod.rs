//! # Latent diffusion networks
//!
//! The Stable Diffusion v1.5 components used for generation, laid out so
//! that the diffusers-format safetensors weights load directly into them:
//! the CLIP text encoder, the conditional UNet, the ControlNet branch, the
//! latent decoder and the DDIM scheduler.
pub mod clip;
pub mod controlnet;
pub mod ddim;
mod layers;
pub mod unet;
pub mod vae;
