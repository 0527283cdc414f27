use crate::config::ImageFormat;
use mime::Mime;

/// One media range a client declared it can render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedType {
    /// `*/*`
    Any,
    /// `image/*`
    AnyImage,
    /// `image/<subtype>`, subtype lowercased
    Image(String),
}

impl AcceptedType {
    pub fn matches(&self, format: ImageFormat) -> bool {
        match self {
            AcceptedType::Any | AcceptedType::AnyImage => true,
            AcceptedType::Image(subtype) => match subtype.as_str() {
                "jpeg" | "jpg" | "pjpeg" => matches!(format, ImageFormat::jpeg | ImageFormat::jpg),
                "heic" => format == ImageFormat::heif,
                "x-icon" | "vnd.microsoft.icon" => format == ImageFormat::ico,
                other => format.extension() == other,
            },
        }
    }

    fn from_mime(m: &Mime) -> Option<Self> {
        if m.type_() == mime::STAR && m.subtype() == mime::STAR {
            return Some(AcceptedType::Any);
        }
        if m.type_() != mime::IMAGE {
            return None;
        }
        if m.subtype() == mime::STAR {
            Some(AcceptedType::AnyImage)
        } else {
            Some(AcceptedType::Image(m.subtype().as_str().to_ascii_lowercase()))
        }
    }
}

/// Parses an `Accept` header into the media ranges the client will take.
///
/// Ranges with `q=0` are explicit refusals and are dropped, as are non-image
/// types and anything that does not parse. Bare format names (`webp`) are
/// accepted as shorthand for `image/webp`. A missing header means the client
/// accepts anything.
pub fn parse_accept(header: Option<&str>) -> Vec<AcceptedType> {
    let Some(header) = header else {
        return vec![AcceptedType::Any];
    };

    let mut accepted = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<Mime>() {
            Ok(m) => {
                let refused = m
                    .get_param("q")
                    .and_then(|q| q.as_str().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0);
                if refused {
                    continue;
                }
                if let Some(t) = AcceptedType::from_mime(&m) {
                    accepted.push(t);
                }
            }
            Err(_) => {
                if let Ok(format) = part.parse::<ImageFormat>() {
                    accepted.push(AcceptedType::Image(format.extension().to_string()));
                }
            }
        }
    }
    accepted
}

/// Picks the highest-priority server format the client accepts.
///
/// Priority is position in `supported`; the client's own ordering and
/// q-values only decide acceptance, never preference.
pub fn negotiate(accepted: &[AcceptedType], supported: &[ImageFormat]) -> Option<ImageFormat> {
    supported
        .iter()
        .copied()
        .find(|format| accepted.iter().any(|a| a.matches(*format)))
}
