//! # Request dispatch
//!
//! Serves one generation request against a [`Registry`]: picks the pipeline
//! for the requested control, builds the control image and writes the
//! generated image to a fresh PNG file.
use crate::annotator;
use crate::control::Control;
use crate::error::{Error, Result};
use crate::pipeline::PipelineInput;
use crate::registry::Registry;
use crate::settings::Settings;
use image::{ImageOutputFormat, RgbImage};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// The encoded input image, in any format the `image` crate decodes.
    pub image: Vec<u8>,
    pub prompt: String,
    pub negative_prompt: String,
    pub control: Control,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// Random when not set, the seed used is reported in the result.
    pub seed: Option<i64>,
}

impl GenerationRequest {
    pub fn new(image: Vec<u8>, prompt: impl Into<String>, control: Control) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            negative_prompt: String::new(),
            control,
            num_inference_steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_inference_steps == 0 {
            return Err(Error::InvalidRequest("the step count must be at least 1".to_string()));
        }
        if !self.guidance_scale.is_finite() {
            return Err(Error::InvalidRequest(format!(
                "invalid guidance scale {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// The generated PNG, left on disk for the caller.
    pub path: PathBuf,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Short side of the control image.
    pub resolution: u32,
    /// Where outputs are written, the system temporary directory if unset.
    pub output_dir: Option<PathBuf>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for DispatchOptions {
    fn from(settings: &Settings) -> Self {
        Self { resolution: settings.resolution, output_dir: None }
    }
}

/// [`generate_with`] using the default options, library callers with their
/// own [`Settings`] pass `&DispatchOptions::from(&settings)` to
/// [`generate_with`] instead.
pub fn generate(request: &GenerationRequest, registry: &Registry) -> Result<GenerationResult> {
    generate_with(request, registry, &DispatchOptions::default())
}

pub fn generate_with(
    request: &GenerationRequest,
    registry: &Registry,
    options: &DispatchOptions,
) -> Result<GenerationResult> {
    let control_type = request.control.control_type();
    let pipeline = registry.get(control_type).ok_or_else(|| Error::InvalidControlType {
        requested: control_type,
        available: registry.control_types(),
    })?;
    request.validate()?;

    let image = image::load_from_memory(&request.image).map_err(Error::ImageDecode)?.to_rgb8();
    let image = annotator::resize_for_control(&image, options.resolution)?;
    let control = annotator::annotate(&request.control, &image, registry.depth_estimator())?;

    let seed = match request.seed {
        Some(seed) => seed,
        None => {
            let seed = rand::random::<u32>() as i64;
            log::info!("Using random seed {seed}.");
            seed
        }
    };
    log::info!("Running with prompt \"{}\" and {} control.", request.prompt, control_type);
    let output = pipeline.run(&PipelineInput {
        prompt: &request.prompt,
        negative_prompt: &request.negative_prompt,
        control: &control,
        steps: request.num_inference_steps,
        guidance_scale: request.guidance_scale,
        seed,
    })?;
    let (width, height) = output.dimensions();
    let path = write_png(&output, options.output_dir.as_deref())?;
    log::info!("Wrote {width}x{height} image to {path:?}.");
    Ok(GenerationResult { path, seed, width, height })
}

fn write_png(image: &RgbImage, dir: Option<&Path>) -> Result<PathBuf> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("controlnet-").suffix(".png");
    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    {
        let mut writer = std::io::BufWriter::new(file.as_file_mut());
        image.write_to(&mut writer, ImageOutputFormat::Png)?;
        writer.flush()?;
    }
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_and_validation() {
        let mut request = GenerationRequest::new(vec![], "a room", Control::Depth);
        assert_eq!(request.num_inference_steps, 20);
        assert_eq!(request.guidance_scale, 7.5);
        assert!(request.negative_prompt.is_empty());
        assert!(request.validate().is_ok());
        request.num_inference_steps = 0;
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
        request.num_inference_steps = 1;
        request.guidance_scale = f64::NAN;
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn options_follow_the_settings() {
        assert_eq!(DispatchOptions::default().resolution, Settings::default().resolution);
        let settings = Settings { resolution: 768, ..Default::default() };
        let options = DispatchOptions::from(&settings);
        assert_eq!(options.resolution, 768);
        assert!(options.output_dir.is_none());
    }

    #[test]
    fn png_is_kept_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(8, 4, image::Rgb([1, 2, 3]));
        let path = write_png(&image, Some(dir.path())).unwrap();
        assert_eq!(path.extension().unwrap(), "png");
        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded, image);
    }
}
