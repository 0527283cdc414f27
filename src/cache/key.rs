use crate::config::ImageFormat;
use crate::ImageServerError;
use regex::Regex;
use std::fmt;
use std::num::IntErrorKind;

lazy_static::lazy_static! {
    // At least one digit must sit next to the `x`, so names like `matrix.jpg` never match.
    static ref DERIVATIVE_FILE: Regex = Regex::new(r"^(?:\d+x\d*|x\d+)\.[A-Za-z0-9]+$")
        .expect("derivative pattern is valid");
    static ref SIZED_KEY: Regex = Regex::new(r"^(?:\d+x\d*|x\d+)$").expect("key pattern is valid");
}

/// A requested width or height, already clamped into `1..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension(u32);

impl Dimension {
    /// Clamps `raw` to `max`. Zero and negative values are rejected rather than clamped.
    pub fn new(raw: i64, max: u32) -> Result<Self, ImageServerError> {
        if raw <= 0 {
            return Err(ImageServerError::InvalidArgument(format!(
                "dimension must be a positive integer, got {}",
                raw
            )));
        }
        Ok(Self(raw.min(i64::from(max)) as u32))
    }

    /// Parses a query parameter. Positive values too large for `i64` still clamp to `max`.
    pub fn parse(raw: &str, max: u32) -> Result<Self, ImageServerError> {
        match raw.parse::<i64>() {
            Ok(v) => Self::new(v, max),
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => Self::new(i64::MAX, max),
            Err(_) => Err(ImageServerError::InvalidArgument(format!(
                "dimension must be a positive integer, got {:?}",
                raw
            ))),
        }
    }

    /// Convenience for optional query parameters.
    pub fn from_optional(raw: Option<&str>, max: u32) -> Result<Option<Self>, ImageServerError> {
        raw.map(|v| Self::parse(v, max)).transpose()
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filename base of a derivative inside its image folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<key>.<ext>`, the derivative's name on disk.
    pub fn file_name(&self, format: ImageFormat) -> String {
        format!("{}.{}", self.0, format.extension())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the cache key for a request.
///
/// - both dimensions: `"{w}x{h}"`
/// - width only: `"{w}x"`
/// - height only: `"x{h}"`
/// - neither: the image name itself (full size, re-encoded)
pub fn build_key(width: Option<Dimension>, height: Option<Dimension>, original_name: &str) -> CacheKey {
    let key = match (width, height) {
        (Some(w), Some(h)) => format!("{}x{}", w, h),
        (Some(w), None) => format!("{}x", w),
        (None, Some(h)) => format!("x{}", h),
        (None, None) => original_name.to_string(),
    };
    CacheKey(key)
}

/// Whether `name` has the shape of a sized key (`200x150`, `200x`, `x150`).
///
/// Such names cannot be image names: the full-size key of the image would
/// collide with a sized key.
pub fn is_sized_key(name: &str) -> bool {
    SIZED_KEY.is_match(name)
}

/// Whether `file_name` inside the folder of `image_name` is a generated derivative.
///
/// Only names positively matching the sized-key pattern qualify. The
/// original, full-size re-encodes (which share the image's name) and stray
/// files are never derivatives.
pub fn is_derivative_file(file_name: &str, image_name: &str) -> bool {
    let base = file_name.rsplit_once('.').map(|(b, _)| b).unwrap_or(file_name);
    if base == image_name {
        return false;
    }
    DERIVATIVE_FILE.is_match(file_name)
}
