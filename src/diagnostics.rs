//! # Environment check
//!
//! What the `check` command reports: the Torch backends available and which
//! assets are already on disk, plus a synthetic test image to feed to
//! `predict`.
use crate::assets::{AssetLayout, ModelAsset};
use image::{Rgb, RgbImage};
use std::fmt;
use std::path::PathBuf;

const FLOOR: Rgb<u8> = Rgb([200, 200, 200]);
const WALL: Rgb<u8> = Rgb([150, 150, 200]);
const FURNITURE: Rgb<u8> = Rgb([100, 100, 100]);

/// A crude room drawn on a 512 pixel grid: a light floor, walls along the
/// top and left borders and a dark piece of furniture. Smaller images are
/// cropped from the top-left corner, larger ones padded with black.
pub fn synthetic_room(size: u32) -> RgbImage {
    let mut image = RgbImage::new(size, size);
    let mut fill = |rows: std::ops::Range<u32>, cols: std::ops::Range<u32>, color: Rgb<u8>| {
        for y in rows.start.min(size)..rows.end.min(size) {
            for x in cols.start.min(size)..cols.end.min(size) {
                image.put_pixel(x, y, color);
            }
        }
    };
    fill(100..400, 100..400, FLOOR);
    fill(0..100, 0..512, WALL);
    fill(0..512, 0..100, WALL);
    fill(300..350, 200..300, FURNITURE);
    image
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStatus {
    pub name: String,
    pub path: PathBuf,
    pub present: bool,
    /// Nothing can be generated without it.
    pub required: bool,
}

impl AssetStatus {
    fn new(name: impl Into<String>, asset: &ModelAsset, required: bool) -> Self {
        Self { name: name.into(), path: asset.path.clone(), present: asset.exists(), required }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub cuda: bool,
    pub cudnn: bool,
    pub cuda_devices: i64,
    pub mps: bool,
    pub threads: i32,
    pub assets: Vec<AssetStatus>,
}

impl Report {
    pub fn collect(layout: &AssetLayout) -> Self {
        tch::maybe_init_cuda();
        let base = &layout.base;
        let mut assets = vec![
            AssetStatus::new("unet", &base.unet, true),
            AssetStatus::new("vae", &base.vae, true),
            AssetStatus::new("clip", &base.clip, true),
            AssetStatus::new("vocab", &base.vocab, true),
            AssetStatus::new("depth estimator", &layout.depth_estimator, false),
        ];
        for control in layout.controls() {
            let t = control.control_type;
            assets.push(AssetStatus::new(format!("{t} weights"), &control.weights, false));
            assets.push(AssetStatus::new(format!("{t} config"), &control.config, false));
        }
        Self {
            cuda: tch::Cuda::is_available(),
            cudnn: tch::Cuda::cudnn_is_available(),
            cuda_devices: tch::Cuda::device_count(),
            mps: tch::utils::has_mps(),
            threads: tch::utils::get_num_threads(),
            assets,
        }
    }

    /// Whether every required asset is present.
    pub fn is_ready(&self) -> bool {
        self.assets.iter().all(|a| a.present || !a.required)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cuda available: {} ({} devices)", self.cuda, self.cuda_devices)?;
        writeln!(f, "Cudnn available: {}", self.cudnn)?;
        writeln!(f, "MPS available: {}", self.mps)?;
        writeln!(f, "CPU threads: {}", self.threads)?;
        for asset in self.assets.iter() {
            let status = match (asset.present, asset.required) {
                (true, _) => "ok",
                (false, true) => "MISSING",
                (false, false) => "missing",
            };
            writeln!(f, "{:<16} {:<8} {:?}", asset.name, status, asset.path)?;
        }
        Ok(())
    }
}
