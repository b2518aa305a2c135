//! # Registry
//!
//! The read-only set of pipelines built at startup, one per control type,
//! together with the depth estimator the depth and normal annotators share.
use crate::annotator::DepthEstimator;
use crate::control::ControlType;
use crate::pipeline::Pipeline;
use std::collections::BTreeMap;
use std::fmt;

pub struct Registry {
    pipelines: BTreeMap<ControlType, Box<dyn Pipeline>>,
    depth_estimator: Option<Box<dyn DepthEstimator>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, control_type: ControlType) -> Option<&dyn Pipeline> {
        self.pipelines.get(&control_type).map(|p| p.as_ref())
    }

    pub fn contains(&self, control_type: ControlType) -> bool {
        self.pipelines.contains_key(&control_type)
    }

    /// The registered control types, in [`ControlType::ALL`] order.
    pub fn control_types(&self) -> Vec<ControlType> {
        self.pipelines.keys().copied().collect()
    }

    pub fn depth_estimator(&self) -> Option<&dyn DepthEstimator> {
        self.depth_estimator.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("control_types", &self.control_types())
            .field("depth_estimator", &self.depth_estimator.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    pipelines: BTreeMap<ControlType, Box<dyn Pipeline>>,
    depth_estimator: Option<Box<dyn DepthEstimator>>,
}

impl RegistryBuilder {
    /// Registers the pipeline serving `control_type`, replacing any previous
    /// one.
    pub fn pipeline(mut self, control_type: ControlType, pipeline: Box<dyn Pipeline>) -> Self {
        self.pipelines.insert(control_type, pipeline);
        self
    }

    pub fn depth_estimator(mut self, estimator: Box<dyn DepthEstimator>) -> Self {
        self.depth_estimator = Some(estimator);
        self
    }

    pub fn build(self) -> Registry {
        Registry { pipelines: self.pipelines, depth_estimator: self.depth_estimator }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::pipeline::PipelineInput;
    use image::RgbImage;

    struct Blank;

    impl Pipeline for Blank {
        fn run(&self, input: &PipelineInput<'_>) -> Result<RgbImage> {
            let (w, h) = input.control.dimensions();
            Ok(RgbImage::new(w, h))
        }
    }

    #[test]
    fn keys_follow_control_type_order() {
        let registry = Registry::builder()
            .pipeline(ControlType::Normal, Box::new(Blank))
            .pipeline(ControlType::Canny, Box::new(Blank))
            .build();
        assert_eq!(registry.control_types(), [ControlType::Canny, ControlType::Normal]);
        assert!(registry.get(ControlType::Depth).is_none());
        assert!(registry.contains(ControlType::Canny));
        assert!(registry.depth_estimator().is_none());
        assert!(!registry.is_empty());
        assert!(Registry::builder().build().is_empty());
    }
}
