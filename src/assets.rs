//! # Model assets
//!
//! Local layout of the downloaded weight and config files, and the logic
//! making sure they are present before anything gets loaded.
use crate::control::ControlType;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

const CONTROLNET_REPO: &str = "https://huggingface.co/lllyasviel/ControlNet-v1-1/resolve/main";
const SD_REPO: &str = "https://huggingface.co/stable-diffusion-v1-5/stable-diffusion-v1-5/resolve/main";
const CLIP_VOCAB_URL: &str =
    "https://github.com/openai/CLIP/raw/main/clip/bpe_simple_vocab_16e6.txt.gz";
const MIDAS_URL: &str =
    "https://github.com/isl-org/MiDaS/releases/download/v2_1/model-small-traced.pt";

/// How the remote payload is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    /// Gzip compressed remotely, decompressed on download.
    Gzip,
}

/// A single file: where it lives locally and where to get it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub url: String,
    pub path: PathBuf,
    pub encoding: Encoding,
}

impl ModelAsset {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { url: url.into(), path: path.into(), encoding: Encoding::Plain }
    }

    pub fn gzipped(mut self) -> Self {
        self.encoding = Encoding::Gzip;
        self
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// The weight/config pair of the ControlNet for one control type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAssets {
    pub control_type: ControlType,
    pub weights: ModelAsset,
    pub config: ModelAsset,
}

impl ControlAssets {
    fn new(models_dir: &Path, control_type: ControlType) -> Self {
        // The depth model only exists in its v11f1p revision and the v1.1
        // normal model is the "normalbae" one.
        let remote = match control_type {
            ControlType::Canny => "control_v11p_sd15_canny",
            ControlType::Depth => "control_v11f1p_sd15_depth",
            ControlType::Normal => "control_v11p_sd15_normalbae",
        };
        let local = format!("control_v11p_sd15_{control_type}");
        Self {
            control_type,
            weights: ModelAsset::new(
                format!("{CONTROLNET_REPO}/{remote}.pth"),
                models_dir.join(format!("{local}.pth")),
            ),
            config: ModelAsset::new(
                format!("{CONTROLNET_REPO}/{remote}.yaml"),
                models_dir.join(format!("{local}.yaml")),
            ),
        }
    }

    pub fn files(&self) -> [&ModelAsset; 2] {
        [&self.weights, &self.config]
    }
}

/// Stable Diffusion v1.5, shared by every pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseAssets {
    pub unet: ModelAsset,
    pub vae: ModelAsset,
    pub clip: ModelAsset,
    pub vocab: ModelAsset,
}

impl BaseAssets {
    fn new(models_dir: &Path) -> Self {
        let dir = models_dir.join("sd15");
        Self {
            unet: ModelAsset::new(
                format!("{SD_REPO}/unet/diffusion_pytorch_model.safetensors"),
                dir.join("unet.safetensors"),
            ),
            vae: ModelAsset::new(
                format!("{SD_REPO}/vae/diffusion_pytorch_model.safetensors"),
                dir.join("vae.safetensors"),
            ),
            clip: ModelAsset::new(
                format!("{SD_REPO}/text_encoder/model.safetensors"),
                dir.join("clip.safetensors"),
            ),
            vocab: ModelAsset::new(CLIP_VOCAB_URL, dir.join("bpe_simple_vocab_16e6.txt")).gzipped(),
        }
    }

    pub fn files(&self) -> [&ModelAsset; 4] {
        [&self.unet, &self.vae, &self.clip, &self.vocab]
    }
}

/// Where every asset lives under the models directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLayout {
    pub base: BaseAssets,
    /// Traced MiDaS model used by the depth and normal annotators.
    pub depth_estimator: ModelAsset,
    controls: Vec<ControlAssets>,
}

impl AssetLayout {
    pub fn new<P: AsRef<Path>>(models_dir: P) -> Self {
        let models_dir = models_dir.as_ref();
        let controls = ControlType::ALL
            .iter()
            .map(|&control_type| ControlAssets::new(models_dir, control_type))
            .collect();
        Self {
            base: BaseAssets::new(models_dir),
            depth_estimator: ModelAsset::new(
                MIDAS_URL,
                models_dir.join("annotators").join("midas_v21_small_traced.pt"),
            ),
            controls,
        }
    }

    pub fn control(&self, control_type: ControlType) -> &ControlAssets {
        &self.controls[control_type.index()]
    }

    pub fn controls(&self) -> &[ControlAssets] {
        &self.controls
    }
}

/// Retrieves a remote file. Implementations write the raw payload to `out`
/// and return the number of bytes written.
pub trait Fetcher {
    fn fetch(
        &self,
        url: &str,
        out: &mut dyn Write,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Blocking HTTP(S) downloads, following redirects.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self { agent: ureq::AgentBuilder::new().redirects(8).build() }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        out: &mut dyn Write,
    ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let response = self.agent.get(url).call()?;
        let mut reader = response.into_reader();
        Ok(std::io::copy(&mut reader, out)?)
    }
}

/// Outcome of [`ensure`] for a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Already on disk, nothing was fetched.
    Present,
    /// Downloaded during this call.
    Fetched,
    /// Absent and fetching was disabled.
    Missing,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Makes sure `asset` exists locally, downloading it with `fetcher` when it
/// does not. Passing no fetcher never touches the network.
///
/// The payload is written to a temporary file in the destination directory
/// and only renamed into place once complete, so a failed download leaves no
/// file behind.
pub fn ensure(asset: &ModelAsset, fetcher: Option<&dyn Fetcher>) -> Result<Availability> {
    if asset.exists() {
        return Ok(Availability::Present);
    }
    let fetcher = match fetcher {
        Some(fetcher) => fetcher,
        None => {
            log::warn!("{:?} is missing and downloads are disabled", asset.path);
            return Ok(Availability::Missing);
        }
    };
    let dir = match asset.path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    log::info!("Downloading {} to {:?}.", asset.url, asset.path);
    let mut tmp = tempfile::Builder::new().prefix(".download-").tempfile_in(&dir)?;
    let written = match asset.encoding {
        Encoding::Plain => fetcher.fetch(&asset.url, tmp.as_file_mut()),
        Encoding::Gzip => {
            let mut decoder = flate2::write::GzDecoder::new(tmp.as_file_mut());
            fetcher.fetch(&asset.url, &mut decoder).and_then(|n| {
                decoder.finish()?;
                Ok(n)
            })
        }
    }
    .map_err(|e| Error::fetch(&asset.url, e))?;
    tmp.as_file_mut().flush()?;
    tmp.persist(&asset.path).map_err(|e| e.error)?;
    log::info!("Fetched {} bytes for {:?}.", written, asset.path);
    Ok(Availability::Fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StaticFetcher {
        payload: Vec<u8>,
        urls: RefCell<Vec<String>>,
    }

    impl Fetcher for StaticFetcher {
        fn fetch(
            &self,
            url: &str,
            out: &mut dyn Write,
        ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            self.urls.borrow_mut().push(url.to_string());
            out.write_all(&self.payload)?;
            Ok(self.payload.len() as u64)
        }
    }

    struct BrokenFetcher;

    impl Fetcher for BrokenFetcher {
        fn fetch(
            &self,
            _url: &str,
            out: &mut dyn Write,
        ) -> std::result::Result<u64, Box<dyn std::error::Error + Send + Sync>> {
            out.write_all(b"partial")?;
            Err("connection reset".into())
        }
    }

    #[test]
    fn layout_file_names() {
        let layout = AssetLayout::new("models");
        let canny = layout.control(ControlType::Canny);
        assert_eq!(canny.weights.path, Path::new("models/control_v11p_sd15_canny.pth"));
        assert_eq!(canny.config.path, Path::new("models/control_v11p_sd15_canny.yaml"));
        assert!(canny.weights.url.ends_with("/control_v11p_sd15_canny.pth"));
        let depth = layout.control(ControlType::Depth);
        assert_eq!(depth.weights.path, Path::new("models/control_v11p_sd15_depth.pth"));
        assert!(depth.config.url.ends_with("/control_v11f1p_sd15_depth.yaml"));
        let normal = layout.control(ControlType::Normal);
        assert_eq!(normal.config.path, Path::new("models/control_v11p_sd15_normal.yaml"));
        assert_eq!(layout.controls().len(), 3);
        assert_eq!(layout.base.vocab.encoding, Encoding::Gzip);
    }

    #[test]
    fn fetches_missing_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let asset = ModelAsset::new("https://example.com/a.bin", dir.path().join("sub/a.bin"));
        let fetcher = StaticFetcher { payload: b"weights".to_vec(), urls: RefCell::new(vec![]) };
        assert_eq!(ensure(&asset, Some(&fetcher)).unwrap(), Availability::Fetched);
        assert_eq!(std::fs::read(&asset.path).unwrap(), b"weights");
        assert_eq!(ensure(&asset, Some(&fetcher)).unwrap(), Availability::Present);
        assert_eq!(fetcher.urls.borrow().as_slice(), ["https://example.com/a.bin"]);
    }

    #[test]
    fn gzipped_payload_is_decompressed() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"\"bpe_simple_vocab\"\nab c\n").unwrap();
        let payload = encoder.finish().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let asset = ModelAsset::new("https://example.com/v.txt.gz", dir.path().join("v.txt"))
            .gzipped();
        let fetcher = StaticFetcher { payload, urls: RefCell::new(vec![]) };
        ensure(&asset, Some(&fetcher)).unwrap();
        assert_eq!(std::fs::read_to_string(&asset.path).unwrap(), "\"bpe_simple_vocab\"\nab c\n");
    }

    #[test]
    fn failed_fetch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let asset = ModelAsset::new("https://example.com/a.pth", dir.path().join("a.pth"));
        let err = ensure(&asset, Some(&BrokenFetcher)).unwrap_err();
        assert!(matches!(err, Error::AssetFetch { ref url, .. } if url == "https://example.com/a.pth"));
        assert!(!asset.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn offline_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let asset = ModelAsset::new("https://example.com/a.pth", dir.path().join("a.pth"));
        assert_eq!(ensure(&asset, None).unwrap(), Availability::Missing);
        assert!(!Availability::Missing.is_available());
        assert!(!asset.exists());
    }
}
