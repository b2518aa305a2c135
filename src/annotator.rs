//! # Annotators
//!
//! Structural feature extractors producing the control images: Canny edges,
//! monocular depth and surface normals derived from that depth.
use crate::control::{CannyThresholds, Control, NormalParams};
use crate::error::{Error, Result};
use crate::utils;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Estimates relative depth from a single image.
pub trait DepthEstimator {
    /// Returns a `(height, width)` float tensor on the CPU with the same
    /// size as `image`, larger values being closer to the camera.
    fn estimate(&self, image: &RgbImage) -> Result<Tensor>;
}

const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

/// MiDaS exported as a TorchScript module.
pub struct MidasEstimator {
    module: tch::CModule,
    device: Device,
    input_size: u32,
}

impl MidasEstimator {
    /// Loads the traced MiDaS v2.1 small model, which works on 256x256
    /// inputs.
    pub fn load<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let module = tch::CModule::load_on_device(path, device)?;
        Ok(Self { module, device, input_size: 256 })
    }
}

impl DepthEstimator for MidasEstimator {
    fn estimate(&self, image: &RgbImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        let resized =
            image::imageops::resize(image, self.input_size, self.input_size, FilterType::CatmullRom);
        let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]);
        let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]);
        let input = utils::image_to_tensor(&resized)?.to_kind(Kind::Float) / 255.;
        let input = ((input - mean) / std).to_kind(Kind::Float).to_device(self.device);
        let depth = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let size = depth.size();
        let (h, w) = match size.as_slice() {
            [.., h, w] => (*h, *w),
            _ => return Err(tch::TchError::Shape(format!("unexpected depth shape {size:?}")).into()),
        };
        let depth = depth
            .f_reshape([1, 1, h, w])?
            .f_upsample_bicubic2d([height as i64, width as i64], false, None, None)?
            .f_reshape([height as i64, width as i64])?
            .f_to_device(Device::Cpu)?;
        Ok(depth)
    }
}

/// Largest side of a control image, and so of a generated image.
pub const MAX_CONTROL_SIDE: u32 = 2048;

/// The size of the control image for a `width`x`height` input: the short
/// side becomes `resolution` pixels, both sides being rounded to multiples
/// of 64. Inputs whose long side would exceed [`MAX_CONTROL_SIDE`] are
/// rejected.
pub fn control_size(width: u32, height: u32, resolution: u32) -> Result<(u32, u32)> {
    let k = resolution as f64 / width.min(height).max(1) as f64;
    let new_width = utils::round_to_multiple(width as f64 * k, 64);
    let new_height = utils::round_to_multiple(height as f64 * k, 64);
    if new_width.max(new_height) > MAX_CONTROL_SIDE as u64 {
        return Err(Error::InvalidRequest(format!(
            "a {width}x{height} image would be resized to {new_width}x{new_height}, \
             above the {MAX_CONTROL_SIDE} pixel limit"
        )));
    }
    Ok((new_width as u32, new_height as u32))
}

/// Rescales `image` to its [`control_size`].
pub fn resize_for_control(image: &RgbImage, resolution: u32) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = control_size(width, height, resolution)?;
    if (new_width, new_height) == (width, height) {
        return Ok(image.clone());
    }
    let filter = if new_width > width { FilterType::Lanczos3 } else { FilterType::Triangle };
    Ok(image::imageops::resize(image, new_width, new_height, filter))
}

/// Canny edges on the luminance, white edges on a black background.
pub fn canny(image: &RgbImage, thresholds: &CannyThresholds) -> RgbImage {
    let gray = DynamicImage::ImageRgb8(image.clone()).to_luma8();
    let edges = imageproc::edges::canny(&gray, thresholds.low(), thresholds.high());
    DynamicImage::ImageLuma8(edges).to_rgb8()
}

fn min_max_normalize(depth: &Tensor) -> Tensor {
    let depth = depth.to_kind(Kind::Float);
    let depth = &depth - depth.min();
    let max = depth.max().double_value(&[]);
    if max > 0. {
        depth / max
    } else {
        depth
    }
}

/// Grayscale depth map, the closest point being white.
pub fn depth_map(depth: &Tensor) -> Result<RgbImage> {
    let gray = (min_max_normalize(depth) * 255.).clamp(0., 255.).to_kind(Kind::Uint8);
    let rgb = Tensor::f_stack(&[&gray, &gray, &gray], 0)?;
    utils::tensor_to_image(&rgb)
}

fn sobel(depth: &Tensor, kernel: [f32; 9]) -> Result<Tensor> {
    let (h, w) = depth.size2()?;
    let kernel = Tensor::from_slice(&kernel).view([1, 1, 3, 3]);
    let xs = depth
        .f_reshape([1, 1, h, w])?
        .f_reflection_pad2d([1, 1, 1, 1])?
        .f_conv2d(&kernel, None::<Tensor>, [1, 1], [0, 0], [1, 1], 1)?;
    Ok(xs.f_reshape([h, w])?)
}

/// Surface normals estimated from the depth gradients, in the colors the
/// `normalbae` ControlNet was trained on: red for normals pointing left,
/// green for up and blue towards the camera.
pub fn normal_map(depth: &Tensor, params: &NormalParams) -> Result<RgbImage> {
    let a = 2. * std::f64::consts::PI;
    let depth = depth.to_kind(Kind::Float);
    let background = min_max_normalize(&depth).lt(params.background_threshold as f64);
    let x = sobel(&depth, [-1., 0., 1., -2., 0., 2., -1., 0., 1.])?.masked_fill(&background, 0.);
    let y = sobel(&depth, [-1., -2., -1., 0., 0., 0., 1., 2., 1.])?.masked_fill(&background, 0.);
    let z = x.ones_like() * a;
    let norm = (&x * &x + &y * &y + &z * &z).sqrt();
    let normal = Tensor::f_stack(&[&x, &y, &z], 0)? / norm.unsqueeze(0);
    let normal = (normal * 127.5 + 127.5).clamp(0., 255.).to_kind(Kind::Uint8);
    utils::tensor_to_image(&normal)
}

/// Produces the control image for `control`. Depth based controls need an
/// estimator.
pub fn annotate(
    control: &Control,
    image: &RgbImage,
    estimator: Option<&dyn DepthEstimator>,
) -> Result<RgbImage> {
    match control {
        Control::Canny(thresholds) => Ok(canny(image, thresholds)),
        Control::Depth => {
            let estimator = estimator.ok_or(Error::MissingAnnotator(control.control_type()))?;
            depth_map(&estimator.estimate(image)?)
        }
        Control::Normal(params) => {
            let estimator = estimator.ok_or(Error::MissingAnnotator(control.control_type()))?;
            normal_map(&estimator.estimate(image)?, params)
        }
    }
}
