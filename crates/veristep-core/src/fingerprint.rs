//! Perceptual identity test for step-evidence images.
//!
//! The hash is a 64-bit difference hash over an 9x8 luma downsample: stable
//! under re-encoding of the same visual content, unlike a byte digest.

use crate::errors::ImageError;
use base64::Engine as _;
use image::imageops::FilterType;
use image::DynamicImage;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Accepted image reference forms, classified before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Url(String),
    DataUri(String),
    Base64(String),
}

impl ImageRef {
    /// Classify a string reference. Bare base64 is distinguished from a file
    /// path by a minimum-length + alphabet heuristic.
    pub fn parse(input: &str) -> Result<ImageRef, ImageError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ImageError::Unsupported("empty image reference".into()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(ImageRef::Url(s.to_string()));
        }
        if s.starts_with("data:") {
            return Ok(ImageRef::DataUri(s.to_string()));
        }
        if looks_like_base64(s) {
            return Ok(ImageRef::Base64(s.to_string()));
        }
        let path = Path::new(s);
        if path.is_file() {
            return Ok(ImageRef::Path(path.to_path_buf()));
        }
        Err(ImageError::Unsupported(format!(
            "not a URL, data URI, base64 payload or readable file: {}",
            truncate_for_log(s)
        )))
    }
}

fn truncate_for_log(s: &str) -> String {
    if s.chars().count() > 96 {
        let cut: String = s.chars().take(96).collect();
        format!("{}…", cut)
    } else {
        s.to_string()
    }
}

fn looks_like_base64(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/=\s]+$").expect("static regex"));
    s.len() >= 64 && re.is_match(s)
}

/// 64-bit perceptual hash of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHash(pub u64);

impl ImageHash {
    pub fn distance(&self, other: &ImageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl std::fmt::Display for ImageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Resolves image references to bytes and hashes them.
pub struct Fingerprinter {
    http: reqwest::Client,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Fingerprinter {
    pub fn new(fetch_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// `fingerprint(image_ref) -> hash`. Same visual content at different
    /// encodings yields the same hash.
    pub async fn fingerprint(&self, image_ref: &ImageRef) -> Result<ImageHash, ImageError> {
        let bytes = self.resolve(image_ref).await?;
        let img = image::load_from_memory(&bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
        Ok(dhash64(&img))
    }

    async fn resolve(&self, image_ref: &ImageRef) -> Result<Vec<u8>, ImageError> {
        match image_ref {
            ImageRef::Bytes(b) => Ok(b.clone()),
            ImageRef::Path(p) => std::fs::read(p).map_err(|e| ImageError::Fetch {
                url: p.display().to_string(),
                detail: e.to_string(),
            }),
            ImageRef::Url(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ImageError::Fetch {
                        url: url.clone(),
                        detail: e.to_string(),
                    })?;
                if !resp.status().is_success() {
                    return Err(ImageError::Fetch {
                        url: url.clone(),
                        detail: format!("status {}", resp.status()),
                    });
                }
                let body = resp.bytes().await.map_err(|e| ImageError::Fetch {
                    url: url.clone(),
                    detail: e.to_string(),
                })?;
                Ok(body.to_vec())
            }
            ImageRef::DataUri(uri) => decode_data_uri(uri),
            ImageRef::Base64(b64) => decode_base64_payload(b64),
        }
    }
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>, ImageError> {
    let payload = uri
        .split_once(";base64,")
        .map(|(_, p)| p)
        .ok_or_else(|| ImageError::Unsupported("data URI without base64 payload".into()))?;
    decode_base64_payload(payload)
}

fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, ImageError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ImageError::Decode(format!("invalid base64: {}", e)))
}

/// Row-wise gradient hash over a 9x8 grayscale downsample.
fn dhash64(img: &DynamicImage) -> ImageHash {
    let small = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut value = 0u64;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            value = (value << 1) | u64::from(left > right);
        }
    }
    ImageHash(value)
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Deterministic test image: a white bar whose position depends on the
    /// seed, so different seeds produce perceptually distinct content.
    pub fn sample_image(seed: u8) -> RgbImage {
        let bar = (u32::from(seed) * 4) % 24;
        RgbImage::from_fn(32, 32, |x, y| {
            if x >= bar && x < bar + 6 && y >= 4 && y < 28 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    pub fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).expect("encode test image");
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{encode, sample_image};
    use super::*;
    use base64::Engine as _;
    use image::ImageFormat;

    #[tokio::test]
    async fn same_content_different_encodings_hash_identically() {
        let img = sample_image(1);
        let png = ImageRef::Bytes(encode(&img, ImageFormat::Png));
        let bmp = ImageRef::Bytes(encode(&img, ImageFormat::Bmp));
        let fp = Fingerprinter::default();
        let h1 = fp.fingerprint(&png).await.unwrap();
        let h2 = fp.fingerprint(&bmp).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn distinct_content_hashes_differ() {
        let fp = Fingerprinter::default();
        let h1 = fp
            .fingerprint(&ImageRef::Bytes(encode(&sample_image(1), ImageFormat::Png)))
            .await
            .unwrap();
        let h2 = fp
            .fingerprint(&ImageRef::Bytes(encode(&sample_image(4), ImageFormat::Png)))
            .await
            .unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn data_uri_and_bare_base64_resolve() {
        let png = encode(&sample_image(2), ImageFormat::Png);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&png);
        let fp = Fingerprinter::default();

        let from_uri = fp
            .fingerprint(&ImageRef::parse(&format!("data:image/png;base64,{}", b64)).unwrap())
            .await
            .unwrap();
        let from_bare = fp
            .fingerprint(&ImageRef::parse(&b64).unwrap())
            .await
            .unwrap();
        assert_eq!(from_uri, from_bare);
    }

    #[test]
    fn parse_rejects_short_or_alien_strings() {
        assert!(matches!(
            ImageRef::parse(""),
            Err(ImageError::Unsupported(_))
        ));
        assert!(matches!(
            ImageRef::parse("definitely not an image"),
            Err(ImageError::Unsupported(_))
        ));
        // Short base64-looking strings fall below the length heuristic.
        assert!(matches!(
            ImageRef::parse("QUJD"),
            Err(ImageError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_classifies_urls_and_data_uris() {
        assert!(matches!(
            ImageRef::parse("https://host/x.png"),
            Ok(ImageRef::Url(_))
        ));
        assert!(matches!(
            ImageRef::parse("data:image/png;base64,AAAA"),
            Ok(ImageRef::DataUri(_))
        ));
    }

    #[tokio::test]
    async fn malformed_bytes_are_a_decode_error() {
        let fp = Fingerprinter::default();
        let err = fp
            .fingerprint(&ImageRef::Bytes(vec![0u8; 128]))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Decode(_)));
    }
}
