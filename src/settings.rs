use std::path::PathBuf;

/// Process-wide configuration, fixed before provisioning starts.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for every downloaded asset.
    pub models_dir: PathBuf,
    /// When set, absent assets are never fetched; control types whose files
    /// are missing are left out of the registry.
    pub offline: bool,
    /// Components forced onto the CPU, e.g. `unet`, `vae`, `clip`,
    /// `annotator` or `all`.
    pub cpu: Vec<String>,
    /// The size of the sliced attention, 0 for automatic slicing and `None`
    /// to disable slicing.
    pub sliced_attention_size: Option<i64>,
    /// Length of the short side of the control image, in pixels.
    pub resolution: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            offline: false,
            cpu: vec![],
            sliced_attention_size: Some(0),
            resolution: 512,
        }
    }
}
