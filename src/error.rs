use crate::control::ControlType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch {url}: {source}")]
    AssetFetch {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("required asset {0:?} is missing and downloads are disabled")]
    MissingAsset(std::path::PathBuf),

    #[error("control type '{requested}' not available, use one of: {}", list(.available))]
    InvalidControlType { requested: ControlType, available: Vec<ControlType> },

    #[error("unknown control type '{0}', expected one of: canny, depth, normal")]
    UnknownControlType(String),

    #[error("cannot decode input image: {0}")]
    ImageDecode(#[source] image::ImageError),

    #[error("no annotator registered for control type '{0}'")]
    MissingAnnotator(ControlType),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn list(types: &[ControlType]) -> String {
    if types.is_empty() {
        return "<none>".to_string();
    }
    types.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

impl Error {
    pub(crate) fn fetch<E>(url: &str, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::AssetFetch { url: url.to_string(), source: source.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
