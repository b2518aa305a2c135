use crate::error::Result;
use image::RgbImage;
use std::path::Path;
use tch::{Device, Kind, Tensor};

// A simple wrapper around File::open adding details about the
// problematic file.
pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}: {e}", path.as_ref().to_string_lossy());
        std::io::Error::new(e.kind(), context).into()
    })
}

/// Places each model component on the accelerator unless it was listed as
/// forced onto the CPU, either by name (`clip`, `unet`, `vae`, `annotator`)
/// or through `all`.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

/// Converts an image into a `(1, 3, height, width)` uint8 tensor on the CPU.
pub fn image_to_tensor(image: &RgbImage) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::f_from_data_size(
        image.as_raw(),
        &[1, height as i64, width as i64, 3],
        Kind::Uint8,
    )?;
    Ok(tensor.f_permute([0, 3, 1, 2])?)
}

/// Converts a `(3, height, width)` or `(1, 3, height, width)` uint8 tensor
/// back into an image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = match tensor.dim() {
        4 => tensor.f_squeeze_dim(0)?,
        _ => tensor.shallow_clone(),
    };
    let (channels, height, width) = tensor.size3()?;
    if channels != 3 {
        return Err(tch::TchError::Shape(format!("expected 3 channels, got {channels}")).into());
    }
    let data = tensor
        .f_to_kind(Kind::Uint8)?
        .f_to_device(tch::Device::Cpu)?
        .f_permute([1, 2, 0])?
        .f_contiguous()?
        .f_flatten(0, -1)?;
    let data = Vec::<u8>::try_from(&data)?;
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| tch::TchError::Shape("image buffer size mismatch".to_string()).into())
}

/// Rounds `v` to the nearest multiple of `m`, never returning 0. Values out
/// of range saturate instead of wrapping.
pub(crate) fn round_to_multiple(v: f64, m: u32) -> u64 {
    let multiples = (v / m as f64).round() as u64;
    multiples.max(1).saturating_mul(m as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tensor_round_trip() {
        let image = RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8, y as u8, (x * y) as u8]));
        let tensor = image_to_tensor(&image).unwrap();
        assert_eq!(tensor.size(), [1, 3, 3, 5]);
        assert_eq!(tensor.int64_value(&[0, 0, 1, 4]), 4);
        assert_eq!(tensor.int64_value(&[0, 1, 2, 0]), 2);
        assert_eq!(tensor_to_image(&tensor).unwrap(), image);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to_multiple(512., 64), 512);
        assert_eq!(round_to_multiple(700., 64), 704);
        assert_eq!(round_to_multiple(10., 64), 64);
        assert_eq!(round_to_multiple(16_777_216. * 512., 64), 8_589_934_592);
        assert_eq!(round_to_multiple(f64::INFINITY, 64), u64::MAX);
    }

    #[test]
    fn cpu_overrides() {
        let setup = DeviceSetup::new(vec!["vae".to_string()]);
        assert_eq!(setup.get("vae"), Device::Cpu);
        let setup = DeviceSetup::new(vec!["all".to_string()]);
        assert_eq!(setup.get("unet"), Device::Cpu);
        assert_eq!(setup.get("annotator"), Device::Cpu);
    }

    #[test]
    fn missing_file_mentions_path() {
        let err = file_open("/definitely/not/here.pth").unwrap_err();
        assert!(err.to_string().contains("here.pth"));
    }
}
