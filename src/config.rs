use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_MAX_DIMENSION: u32 = 1000;
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 8 * 1024 * 1024;

/// Output formats the server knows how to name, in negotiation priority order.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    avif,
    webp,
    heif,
    jpeg,
    jpg,
    png,
    bmp,
    gif,
    ico,
}

impl ImageFormat {
    /// Priority order used by negotiation: best compression first.
    pub const PRIORITY: [ImageFormat; 9] = [
        ImageFormat::avif,
        ImageFormat::webp,
        ImageFormat::heif,
        ImageFormat::jpeg,
        ImageFormat::jpg,
        ImageFormat::png,
        ImageFormat::bmp,
        ImageFormat::gif,
        ImageFormat::ico,
    ];

    /// File extension used for derivatives, which is also the format's name.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::avif => "avif",
            ImageFormat::webp => "webp",
            ImageFormat::heif => "heif",
            ImageFormat::jpeg => "jpeg",
            ImageFormat::jpg => "jpg",
            ImageFormat::png => "png",
            ImageFormat::bmp => "bmp",
            ImageFormat::gif => "gif",
            ImageFormat::ico => "ico",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::avif => "image/avif",
            ImageFormat::webp => "image/webp",
            ImageFormat::heif => "image/heif",
            ImageFormat::jpeg | ImageFormat::jpg => "image/jpeg",
            ImageFormat::png => "image/png",
            ImageFormat::bmp => "image/bmp",
            ImageFormat::gif => "image/gif",
            ImageFormat::ico => "image/x-icon",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ImageFormat::PRIORITY
            .iter()
            .copied()
            .find(|f| f.extension() == lower)
            .ok_or_else(|| format!("Invalid format: {}", s))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root folder holding one sub-folder per logical image.
    pub images_dir: PathBuf,
    pub port: u16,
    /// Maximum age of a derivative before the janitor removes it.
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub max_dimension: u32,
    pub max_upload_size: usize, // bytes
    pub quality: u8,
    /// Extensions probed, in order, when locating an original.
    pub original_extensions: Vec<String>,
    /// Format uploads are re-encoded into before being stored as originals.
    pub canonical_format: ImageFormat,
    pub output_formats: Vec<ImageFormat>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("./images"),
            port: DEFAULT_PORT,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            quality: DEFAULT_QUALITY,
            original_extensions: vec!["jpg".into(), "png".into(), "jpeg".into()],
            canonical_format: ImageFormat::png,
            output_formats: ImageFormat::PRIORITY.to_vec(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}")] InvalidEnv { var: &'static str, value: String },
    #[error("Max dimension must be > 0")] InvalidMaxDimension,
    #[error("Max upload size must be > 0")] InvalidMaxUpload,
    #[error("Quality must be within 1..=100")] InvalidQuality,
    #[error("Retention window must be > 0")] InvalidRetention,
    #[error("Sweep interval must be > 0")] InvalidSweepInterval,
    #[error("At least one original extension is required")] NoOriginalExtensions,
    #[error("At least one output format is required")] NoOutputFormats,
    #[error("Canonical format {0} must be one of the original extensions")] CanonicalNotProbed(ImageFormat),
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Builds a configuration from `PORT` and `IMAGESERVER_*` variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Ok(root) = std::env::var("IMAGESERVER_ROOT") {
            cfg.images_dir = PathBuf::from(root);
        }
        if let Some(port) = env_parse("PORT")? { cfg.port = port; }
        if let Some(secs) = env_parse("IMAGESERVER_RETENTION_SECS")? {
            cfg.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("IMAGESERVER_SWEEP_INTERVAL_SECS")? {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("IMAGESERVER_MAX_DIMENSION")? { cfg.max_dimension = max; }
        if let Some(max) = env_parse("IMAGESERVER_MAX_UPLOAD_BYTES")? { cfg.max_upload_size = max; }
        if let Some(q) = env_parse("IMAGESERVER_QUALITY")? { cfg.quality = q; }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dimension == 0 { return Err(ConfigError::InvalidMaxDimension); }
        if self.max_upload_size == 0 { return Err(ConfigError::InvalidMaxUpload); }
        if self.quality == 0 || self.quality > 100 { return Err(ConfigError::InvalidQuality); }
        if self.retention.is_zero() { return Err(ConfigError::InvalidRetention); }
        if self.sweep_interval.is_zero() { return Err(ConfigError::InvalidSweepInterval); }
        if self.original_extensions.is_empty() { return Err(ConfigError::NoOriginalExtensions); }
        if self.output_formats.is_empty() { return Err(ConfigError::NoOutputFormats); }
        if !self.original_extensions.iter().any(|e| e == self.canonical_format.extension()) {
            return Err(ConfigError::CanonicalNotProbed(self.canonical_format));
        }
        Ok(())
    }
}
