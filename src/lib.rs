//! # ControlNet predictor
//!
//! Structure-guided image generation with Stable Diffusion v1.5 and the
//! ControlNet v1.1 models, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! An input photo is turned into a control image (Canny edges, a depth map or
//! a surface-normal map) that steers the diffusion process together with a
//! text prompt.
//!
//! - [`provision`] downloads the weights when needed and builds a
//!   [`Registry`] holding one pipeline per control type.
//! - [`generate`] serves a single request against that registry and writes
//!   the result to a temporary PNG file.
//!
//! The original ControlNet `.pth` checkpoints are read directly, their keys
//! being renamed on the fly to match the [`diffusion`] networks.

pub mod annotator;
pub mod assets;
pub mod checkpoint;
pub mod control;
pub mod controlnet;
pub mod diagnostics;
pub mod diffusion;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod provision;
pub mod registry;
pub mod settings;
pub mod utils;

pub use control::{CannyThresholds, Control, ControlType, NormalParams};
pub use dispatch::{generate, generate_with, DispatchOptions, GenerationRequest, GenerationResult};
pub use error::{Error, Result};
pub use provision::{provision, PipelineFactory, TorchFactory};
pub use registry::Registry;
pub use settings::Settings;
