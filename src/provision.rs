//! # Provisioning
//!
//! Makes sure every asset is on disk, then builds the [`Registry`]: the base
//! model is loaded once and composed with one ControlNet per control type
//! whose files are available.
//!
//! Online, a failed download aborts provisioning. Offline, nothing is
//! downloaded and control types with missing files are left out, except for
//! the base model files which are always required.
use crate::annotator::{DepthEstimator, MidasEstimator};
use crate::assets::{self, AssetLayout, BaseAssets, ControlAssets, Fetcher, ModelAsset};
use crate::controlnet;
use crate::error::{Error, Result};
use crate::pipeline::{BaseModel, ControlNetPipeline, Pipeline};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::utils::DeviceSetup;
use std::rc::Rc;

/// Builds the runtime objects from files already on disk.
pub trait PipelineFactory {
    /// Whatever the pipelines share, loaded once per provisioning.
    type Base;

    fn load_base(&self, assets: &BaseAssets) -> Result<Self::Base>;

    fn build_pipeline(&self, base: &Self::Base, assets: &ControlAssets)
        -> Result<Box<dyn Pipeline>>;

    fn load_depth_estimator(&self, asset: &ModelAsset) -> Result<Box<dyn DepthEstimator>>;
}

/// Loads the Torch models, placing them according to the settings.
#[derive(Debug, Clone)]
pub struct TorchFactory {
    devices: DeviceSetup,
    sliced_attention_size: Option<i64>,
}

impl TorchFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            devices: DeviceSetup::new(settings.cpu.clone()),
            sliced_attention_size: settings.sliced_attention_size,
        }
    }
}

impl PipelineFactory for TorchFactory {
    type Base = Rc<BaseModel>;

    fn load_base(&self, assets: &BaseAssets) -> Result<Self::Base> {
        let base = BaseModel::load(assets, &self.devices, self.sliced_attention_size)?;
        Ok(Rc::new(base))
    }

    fn build_pipeline(
        &self,
        base: &Self::Base,
        assets: &ControlAssets,
    ) -> Result<Box<dyn Pipeline>> {
        log::info!("Building the {} controlnet.", assets.control_type);
        let controlnet = controlnet::load(assets, base.unet_device(), self.sliced_attention_size)?;
        Ok(Box::new(ControlNetPipeline::new(Rc::clone(base), controlnet)))
    }

    fn load_depth_estimator(&self, asset: &ModelAsset) -> Result<Box<dyn DepthEstimator>> {
        log::info!("Building the depth estimator.");
        let estimator = MidasEstimator::load(&asset.path, self.devices.get("annotator"))?;
        Ok(Box::new(estimator))
    }
}

fn available(asset: &ModelAsset, fetcher: Option<&dyn Fetcher>) -> Result<bool> {
    Ok(assets::ensure(asset, fetcher)?.is_available())
}

/// Fetches what is missing and builds the registry. With `settings.offline`
/// set, `fetcher` is never used.
pub fn provision<F: PipelineFactory>(
    settings: &Settings,
    fetcher: &dyn Fetcher,
    factory: &F,
) -> Result<Registry> {
    let layout = AssetLayout::new(&settings.models_dir);
    let fetcher = if settings.offline { None } else { Some(fetcher) };

    let mut present = vec![];
    for control in layout.controls() {
        let mut complete = true;
        for asset in control.files() {
            complete &= available(asset, fetcher)?;
        }
        if complete {
            present.push(control);
        } else {
            log::warn!("Skipping {}, its controlnet files are missing.", control.control_type);
        }
    }
    for asset in layout.base.files() {
        if !available(asset, fetcher)? {
            return Err(Error::MissingAsset(asset.path.clone()));
        }
    }
    let needs_depth = present.iter().any(|c| c.control_type.needs_depth_estimator());
    if needs_depth && !available(&layout.depth_estimator, fetcher)? {
        present.retain(|c| {
            let keep = !c.control_type.needs_depth_estimator();
            if !keep {
                log::warn!("Skipping {}, the depth estimator is missing.", c.control_type);
            }
            keep
        });
    }

    let base = factory.load_base(&layout.base)?;
    let mut builder = Registry::builder();
    if present.iter().any(|c| c.control_type.needs_depth_estimator()) {
        builder = builder.depth_estimator(factory.load_depth_estimator(&layout.depth_estimator)?);
    }
    for control in present {
        builder = builder.pipeline(control.control_type, factory.build_pipeline(&base, control)?);
    }
    let registry = builder.build();
    if registry.is_empty() {
        log::warn!("No control type could be provisioned.");
    } else {
        let types: Vec<String> = registry.control_types().iter().map(|t| t.to_string()).collect();
        log::info!("Registered control types: {}.", types.join(", "));
    }
    Ok(registry)
}
