//! # Control types
//!
//! The structural signals a ControlNet can be conditioned on, and the
//! per-type parameters a request carries.
use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Selects the feature extractor and the conditioning network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlType {
    Canny,
    Depth,
    Normal,
}

impl ControlType {
    pub const ALL: [ControlType; 3] = [Self::Canny, Self::Depth, Self::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canny => "canny",
            Self::Depth => "depth",
            Self::Normal => "normal",
        }
    }

    /// Position of this type in [`ControlType::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Whether the extractor for this type needs the monocular depth model.
    pub fn needs_depth_estimator(&self) -> bool {
        matches!(self, Self::Depth | Self::Normal)
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "canny" => Ok(Self::Canny),
            "depth" => Ok(Self::Depth),
            "normal" => Ok(Self::Normal),
            _ => Err(Error::UnknownControlType(s.to_string())),
        }
    }
}

/// Gradient cutoffs for the Canny edge detector.
///
/// The pair is stored in ascending order: building it from a reversed pair
/// swaps the two values, so `(200, 100)` detects the same edges as
/// `(100, 200)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CannyThresholds {
    low: f32,
    high: f32,
}

impl CannyThresholds {
    pub fn new(low: u32, high: u32) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Self { low: low as f32, high: high as f32 }
    }

    pub fn low(&self) -> f32 {
        self.low
    }

    pub fn high(&self) -> f32 {
        self.high
    }
}

impl Default for CannyThresholds {
    fn default() -> Self {
        Self::new(100, 200)
    }
}

/// Parameters for the depth to surface-normal conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalParams {
    /// Pixels whose normalized depth is below this value are treated as
    /// background and get a flat normal.
    pub background_threshold: f32,
}

impl Default for NormalParams {
    fn default() -> Self {
        Self { background_threshold: 0.1 }
    }
}

/// A control selector together with the parameters that only make sense
/// for that selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Canny(CannyThresholds),
    Depth,
    Normal(NormalParams),
}

impl Control {
    pub fn control_type(&self) -> ControlType {
        match self {
            Self::Canny(_) => ControlType::Canny,
            Self::Depth => ControlType::Depth,
            Self::Normal(_) => ControlType::Normal,
        }
    }

    /// The control for `control_type` with default parameters.
    pub fn with_defaults(control_type: ControlType) -> Self {
        match control_type {
            ControlType::Canny => Self::Canny(Default::default()),
            ControlType::Depth => Self::Depth,
            ControlType::Normal => Self::Normal(Default::default()),
        }
    }
}
