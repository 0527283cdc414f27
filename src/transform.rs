use crate::config::ImageFormat;
use crate::ImageServerError;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use std::io::Cursor;

/// What a derivative should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: ImageFormat,
    pub quality: u8,
}

/// The resize/transcode capability behind the derivative cache.
///
/// Implementations are CPU-bound and are always called from the blocking
/// thread pool. The output must depend only on the original and the request.
pub trait Transcoder: Send + Sync + 'static {
    /// Whether this transcoder can produce `format` at all.
    fn supports(&self, _format: ImageFormat) -> bool {
        true
    }

    fn transcode(&self, original: &[u8], request: &TranscodeRequest) -> Result<Vec<u8>, ImageServerError>;
}

/// Transcoder backed by the `image` crate, with lossy WebP from `webp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTranscoder;

impl Transcoder for ImageTranscoder {
    fn supports(&self, format: ImageFormat) -> bool {
        format != ImageFormat::heif
    }

    fn transcode(&self, original: &[u8], request: &TranscodeRequest) -> Result<Vec<u8>, ImageServerError> {
        let img = decode_image(original)?;
        let resized = resize_image(img, request.width, request.height);
        encode_image(&resized, request.format, request.quality)
    }
}

/// Decodes raw image bytes, detecting the format from magic bytes.
///
/// # Errors
/// Returns `ImageServerError::GenerationError` if the format is unknown or
/// the data is corrupt.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ImageServerError> {
    let guessed = image::guess_format(bytes)
        .map_err(|e| ImageServerError::GenerationError(e.to_string()))?;

    image::load_from_memory_with_format(bytes, guessed)
        .map_err(|e| ImageServerError::GenerationError(e.to_string()))
}

/// Resizes with Lanczos3.
///
/// - Both dimensions: scale to cover `w`x`h`, then center-crop to exactly that size
/// - Only width: scale height proportionally
/// - Only height: scale width proportionally
/// - Neither: return original
///
/// Minimum computed dimension is 1 pixel.
pub fn resize_image(img: DynamicImage, w: Option<u32>, h: Option<u32>) -> DynamicImage {
    let (orig_w, orig_h) = img.dimensions();

    match (w, h) {
        (None, None) => img,
        (Some(w), Some(h)) => img.resize_to_fill(w.max(1), h.max(1), FilterType::Lanczos3),
        (Some(w), None) => {
            let ratio = w as f32 / orig_w as f32;
            let target_h = (orig_h as f32 * ratio).round() as u32;
            img.resize_exact(w.max(1), target_h.max(1), FilterType::Lanczos3)
        }
        (None, Some(h)) => {
            let ratio = h as f32 / orig_h as f32;
            let target_w = (orig_w as f32 * ratio).round() as u32;
            img.resize_exact(target_w.max(1), h.max(1), FilterType::Lanczos3)
        }
    }
}

/// Encodes image to the requested format.
///
/// - **JPEG**: RGB, quality-controlled
/// - **WebP**: RGB lossy encoding via libwebp
/// - **AVIF**: RGBA with AV1 compression (slowest, best compression)
/// - **PNG/BMP/GIF/ICO**: RGBA through the `image` crate's encoders; ICO
///   is limited to 256x256
///
/// Quality is clamped to [1, 100] and ignored by the lossless formats.
///
/// # Errors
/// Returns `ImageServerError::GenerationError` on encoder failures or for
/// HEIF, which has no encoder here.
pub fn encode_image(img: &DynamicImage, fmt: ImageFormat, quality: u8) -> Result<Vec<u8>, ImageServerError> {
    let mut out = Vec::new();
    let q = quality.clamp(1, 100);

    match fmt {
        ImageFormat::jpeg | ImageFormat::jpg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let enc = JpegEncoder::new_with_quality(&mut out, q);
            enc.write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| ImageServerError::GenerationError(e.to_string()))?;
        }
        ImageFormat::webp => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoded = webp::Encoder::from_rgb(rgb.as_raw(), w, h).encode(q as f32);
            out.extend_from_slice(&encoded);
        }
        ImageFormat::avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            // Speed 4 balances encoding time and compression ratio
            let enc = AvifEncoder::new_with_speed_quality(&mut out, 4, q);
            enc.write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| ImageServerError::GenerationError(e.to_string()))?;
        }
        ImageFormat::png | ImageFormat::bmp | ImageFormat::gif | ImageFormat::ico => {
            let target = match fmt {
                ImageFormat::png => image::ImageFormat::Png,
                ImageFormat::bmp => image::ImageFormat::Bmp,
                ImageFormat::gif => image::ImageFormat::Gif,
                _ => image::ImageFormat::Ico,
            };
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), target)
                .map_err(|e| ImageServerError::GenerationError(e.to_string()))?;
        }
        ImageFormat::heif => {
            return Err(ImageServerError::GenerationError("no HEIF encoder available".into()));
        }
    }

    Ok(out)
}

/// Re-encodes an uploaded file into the canonical original format.
///
/// Undecodable input is the uploader's fault and surfaces as `InvalidArgument`.
pub fn canonicalize(bytes: &[u8], format: ImageFormat, quality: u8) -> Result<Vec<u8>, ImageServerError> {
    let img = decode_image(bytes).map_err(|e| ImageServerError::InvalidArgument(format!("not a decodable image: {}", e)))?;
    encode_image(&img, format, quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_resize_hits_exact_size() {
        let img = DynamicImage::new_rgb8(800, 600);
        assert_eq!(resize_image(img, Some(200), Some(200)).dimensions(), (200, 200));
    }

    #[test]
    fn single_dimension_keeps_aspect() {
        let img = DynamicImage::new_rgb8(800, 600);
        assert_eq!(resize_image(img.clone(), Some(400), None).dimensions(), (400, 300));
        assert_eq!(resize_image(img.clone(), None, Some(150)).dimensions(), (200, 150));
        assert_eq!(resize_image(img, None, None).dimensions(), (800, 600));
    }

    #[test]
    fn heif_is_not_supported() {
        assert!(!ImageTranscoder.supports(ImageFormat::heif));
        assert!(ImageTranscoder.supports(ImageFormat::avif));
        let img = DynamicImage::new_rgb8(4, 4);
        assert!(encode_image(&img, ImageFormat::heif, 80).is_err());
    }

    #[test]
    fn garbage_is_a_generation_error() {
        let request = TranscodeRequest { width: Some(10), height: None, format: ImageFormat::png, quality: 80 };
        let err = ImageTranscoder.transcode(b"definitely not an image", &request).unwrap_err();
        assert!(matches!(err, ImageServerError::GenerationError(_)));
    }

    #[test]
    fn canonicalize_rejects_garbage_as_bad_input() {
        let err = canonicalize(b"nope", ImageFormat::png, 80).unwrap_err();
        assert!(matches!(err, ImageServerError::InvalidArgument(_)));
    }
}
