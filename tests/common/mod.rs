#![allow(dead_code)]
use controlnet_predictor::annotator::DepthEstimator;
use controlnet_predictor::assets::{BaseAssets, ControlAssets, Fetcher, ModelAsset};
use controlnet_predictor::pipeline::{Pipeline, PipelineInput};
use controlnet_predictor::{ControlType, PipelineFactory, Result};
use image::RgbImage;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;
use tch::{Device, Kind, Tensor};

type FetchResult = std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>>;

/// Serves a fixed payload for every url, gzipped for `.gz` urls.
#[derive(Default)]
pub struct FakeFetcher {
    pub urls: RefCell<Vec<String>>,
    pub fail_on: Option<&'static str>,
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, out: &mut dyn Write) -> FetchResult {
        self.urls.borrow_mut().push(url.to_string());
        if matches!(self.fail_on, Some(pattern) if url.contains(pattern)) {
            return Err("404 not found".into());
        }
        let payload = if url.ends_with(".gz") {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder.write_all(b"\"bpe_simple_vocab_16e6.txt#version: 0.2\n")?;
            encoder.finish()?
        } else {
            url.as_bytes().to_vec()
        };
        out.write_all(&payload)?;
        Ok(payload.len() as u64)
    }
}

/// Depth increasing from left to right.
pub struct RampEstimator;

impl DepthEstimator for RampEstimator {
    fn estimate(&self, image: &RgbImage) -> Result<Tensor> {
        let (w, h) = image.dimensions();
        let row = Tensor::arange(w as i64, (Kind::Float, Device::Cpu));
        Ok(row.view([1, w as i64]).repeat([h as i64, 1]))
    }
}

/// Returns the control image with every channel shifted by the seed, and
/// counts its invocations.
pub struct EchoPipeline {
    pub calls: Rc<Cell<usize>>,
}

impl Pipeline for EchoPipeline {
    fn run(&self, input: &PipelineInput<'_>) -> Result<RgbImage> {
        self.calls.set(self.calls.get() + 1);
        let mut image = input.control.clone();
        let shift = input.seed.rem_euclid(256) as u8;
        for pixel in image.pixels_mut() {
            for c in pixel.0.iter_mut() {
                *c = c.wrapping_add(shift);
            }
        }
        Ok(image)
    }
}

/// Records what gets built instead of loading any model.
#[derive(Default)]
pub struct FakeFactory {
    pub bases: Cell<usize>,
    pub estimators: Cell<usize>,
    pub built: RefCell<Vec<ControlType>>,
    pub calls: Rc<Cell<usize>>,
}

impl PipelineFactory for FakeFactory {
    type Base = ();

    fn load_base(&self, assets: &BaseAssets) -> Result<()> {
        assert!(assets.files().iter().all(|a| a.exists()));
        self.bases.set(self.bases.get() + 1);
        Ok(())
    }

    fn build_pipeline(&self, _base: &(), assets: &ControlAssets) -> Result<Box<dyn Pipeline>> {
        assert!(assets.weights.exists() && assets.config.exists());
        self.built.borrow_mut().push(assets.control_type);
        Ok(Box::new(EchoPipeline { calls: Rc::clone(&self.calls) }))
    }

    fn load_depth_estimator(&self, asset: &ModelAsset) -> Result<Box<dyn DepthEstimator>> {
        assert!(asset.exists());
        self.estimators.set(self.estimators.get() + 1);
        Ok(Box::new(RampEstimator))
    }
}

pub fn touch(asset: &ModelAsset) {
    std::fs::create_dir_all(asset.path.parent().unwrap()).unwrap();
    std::fs::write(&asset.path, b"").unwrap();
}

pub fn encode_png(image: &RgbImage) -> Vec<u8> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageOutputFormat::Png).unwrap();
    bytes.into_inner()
}
