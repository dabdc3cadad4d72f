//! Captured images and the checks applied to them before any stage runs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Image encodings recognised from their leading magic bytes.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
  Jpeg,
  Png,
  Webp,
}

impl ImageFormat {
  pub fn sniff(bytes: &[u8]) -> Option<Self> {
    match bytes {
      [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
      [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Png),
      [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => {
        Some(Self::Webp)
      }
      _ => None,
    }
  }
}

/// Why an uploaded image was rejected. These are input errors: the session
/// does not move and no attempt is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
  #[error("image is empty")]
  Empty,

  #[error("image is {size} bytes, above the {max} byte limit")]
  TooLarge { size: usize, max: usize },

  #[error("image is {size} bytes, below the {min} byte minimum")]
  TooSmall { size: usize, min: usize },

  #[error("unrecognised image encoding")]
  Unrecognised,

  #[error("image format {0} is not accepted")]
  FormatNotAllowed(ImageFormat),
}

/// Accepted encodings and size bounds for uploaded images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePolicy {
  pub allowed_formats: Vec<ImageFormat>,
  pub min_bytes:       usize,
  pub max_bytes:       usize,
}

impl Default for ImagePolicy {
  fn default() -> Self {
    Self {
      allowed_formats: vec![ImageFormat::Jpeg, ImageFormat::Png],
      min_bytes:       1024,
      max_bytes:       10 * 1024 * 1024,
    }
  }
}

impl ImagePolicy {
  /// Check size bounds and encoding; returns the detected format.
  pub fn check(&self, bytes: &[u8]) -> Result<ImageFormat, ImageError> {
    let size = bytes.len();
    if size == 0 {
      return Err(ImageError::Empty);
    }
    if size > self.max_bytes {
      return Err(ImageError::TooLarge { size, max: self.max_bytes });
    }
    if size < self.min_bytes {
      return Err(ImageError::TooSmall { size, min: self.min_bytes });
    }
    let format = ImageFormat::sniff(bytes).ok_or(ImageError::Unrecognised)?;
    if !self.allowed_formats.contains(&format) {
      return Err(ImageError::FormatNotAllowed(format));
    }
    Ok(format)
  }
}

/// Both sides of a document, ready for OCR.
#[derive(Debug, Clone)]
pub struct DocumentImages {
  pub front: Bytes,
  pub back:  Option<Bytes>,
}

/// The selfie still plus any video frames recorded while the user performed
/// the liveness challenges.
#[derive(Debug, Clone)]
pub struct SelfieCapture {
  pub image:  Bytes,
  pub frames: Vec<Bytes>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn jpeg(len: usize) -> Vec<u8> {
    let mut v = vec![0xFF, 0xD8, 0xFF, 0xE0];
    v.resize(len, 0);
    v
  }

  #[test]
  fn accepts_allowed_formats_within_bounds() {
    assert_eq!(ImagePolicy::default().check(&jpeg(4096)), Ok(ImageFormat::Jpeg));
  }

  #[test]
  fn rejects_size_and_format_violations() {
    let policy = ImagePolicy::default();
    assert_eq!(policy.check(&[]), Err(ImageError::Empty));
    assert!(matches!(policy.check(&jpeg(10)), Err(ImageError::TooSmall { .. })));
    assert_eq!(policy.check(&vec![0u8; 4096]), Err(ImageError::Unrecognised));

    let mut webp = b"RIFF\0\0\0\0WEBP".to_vec();
    webp.resize(4096, 0);
    assert_eq!(
      policy.check(&webp),
      Err(ImageError::FormatNotAllowed(ImageFormat::Webp))
    );
  }
}
