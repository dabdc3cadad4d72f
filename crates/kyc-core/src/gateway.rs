//! The `BiometricGateway` trait and the provider-neutral results it returns.
//!
//! Concrete OCR, liveness and face-matching vendors implement this trait.
//! Vendor-specific failures are translated into [`ProviderError`] inside the
//! implementation; nothing vendor-specific crosses this boundary except the
//! opaque `raw_response`, which is stored for audit and never parsed.

use std::future::Future;

use bytes::Bytes;
use chrono::NaiveDate;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::{
  capture::{DocumentImages, SelfieCapture},
  document::DocumentType,
  session::FailureReason,
};

// ─── Stages & errors ─────────────────────────────────────────────────────────

/// The three provider calls a session makes.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderStage {
  Ocr,
  Liveness,
  FaceMatch,
}

impl ProviderStage {
  /// Reason recorded when this stage cannot produce a result at all.
  pub fn failure_reason(self) -> FailureReason {
    match self {
      Self::Ocr => FailureReason::OcrFailed,
      Self::Liveness => FailureReason::LivenessFailed,
      Self::FaceMatch => FailureReason::FaceNotDetected,
    }
  }
}

/// A typed provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
  #[error("provider call timed out")]
  Timeout,

  #[error("provider unavailable: {0}")]
  Unavailable(String),

  #[error("malformed provider response: {0}")]
  MalformedResponse(String),

  /// The provider refused the input outright; retrying will not help.
  #[error("provider rejected the request: {0}")]
  Rejected(String),

  #[error("provider call cancelled")]
  Cancelled,
}

impl ProviderError {
  /// Whether the same call may succeed if attempted again.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::Timeout | Self::Unavailable(_) | Self::MalformedResponse(_)
    )
  }
}

// ─── OCR ─────────────────────────────────────────────────────────────────────

/// Image-quality problems a provider can flag on a document capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageQualityIssue {
  Blurry,
  CutOff,
  Glare,
}

impl ImageQualityIssue {
  pub fn failure_reason(self) -> FailureReason {
    match self {
      Self::Blurry => FailureReason::BlurryDocument,
      Self::CutOff => FailureReason::CutOffDocument,
      Self::Glare => FailureReason::GlareDetected,
    }
  }
}

/// Structured fields read off a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
  pub full_name:       Option<String>,
  pub document_number: Option<String>,
  pub date_of_birth:   Option<NaiveDate>,
  pub expiry_date:     Option<NaiveDate>,
  pub nationality:     Option<String>,
  pub address:         Option<String>,
  pub gender:          Option<String>,
}

impl ExtractedFields {
  /// Enough was read to attempt validation.
  pub fn is_usable(&self) -> bool {
    self.document_number.as_deref().is_some_and(|n| !n.trim().is_empty())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
  pub success:             bool,
  /// Extraction confidence in `[0, 100]`.
  pub confidence:          f64,
  pub fields:              ExtractedFields,
  pub quality_issue:       Option<ImageQualityIssue>,
  pub tamper_suspected:    bool,
  pub errors:              Vec<String>,
  pub provider_session_id: Option<String>,
  pub raw_response:        serde_json::Value,
}

// ─── Liveness ────────────────────────────────────────────────────────────────

/// An action the user is asked to perform on camera.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LivenessChallenge {
  Blink,
  Smile,
  TurnHeadLeft,
  TurnHeadRight,
  Nod,
  OpenMouth,
}

impl LivenessChallenge {
  pub const ALL: [Self; 6] = [
    Self::Blink,
    Self::Smile,
    Self::TurnHeadLeft,
    Self::TurnHeadRight,
    Self::Nod,
    Self::OpenMouth,
  ];
}

/// Pick `count` distinct challenges in random order.
pub fn assign_challenges(count: usize, rng: &mut impl RngCore) -> Vec<LivenessChallenge> {
  let mut pool = LivenessChallenge::ALL;
  let count = count.min(pool.len());
  for i in 0..count {
    let remaining = (pool.len() - i) as u32;
    let j = i + (rng.next_u32() % remaining) as usize;
    pool.swap(i, j);
  }
  pool[..count].to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResult {
  pub challenge: LivenessChallenge,
  pub passed:    bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
  pub passed:              bool,
  /// Liveness score in `[0, 100]`.
  pub score:               f64,
  pub challenges:          Vec<ChallengeResult>,
  pub provider_session_id: Option<String>,
  pub raw_response:        serde_json::Value,
}

// ─── Face match ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatchResult {
  pub success:                   bool,
  /// Similarity in `[0, 100]`.
  pub match_score:               f64,
  /// The provider's own threshold; the session decides with its configured
  /// one.
  pub threshold:                 f64,
  pub passed:                    bool,
  pub face_detected_in_document: bool,
  pub face_detected_in_selfie:   bool,
  pub provider_session_id:       Option<String>,
  pub raw_response:              serde_json::Value,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Capability interface to an OCR / liveness / face-match provider.
///
/// Implementations do not need to enforce timeouts; the orchestrator bounds
/// every call and drops the future when the deadline passes or the session is
/// cancelled.
pub trait BiometricGateway: Send + Sync {
  /// Name recorded on the session for audit.
  fn provider_name(&self) -> &str;

  fn extract_document(
    &self,
    images: DocumentImages,
    document_type: DocumentType,
  ) -> impl Future<Output = Result<OcrResult, ProviderError>> + Send + '_;

  fn evaluate_liveness(
    &self,
    selfie: SelfieCapture,
    challenges: Vec<LivenessChallenge>,
  ) -> impl Future<Output = Result<LivenessResult, ProviderError>> + Send + '_;

  fn compare_faces(
    &self,
    document_image: Bytes,
    selfie_image: Bytes,
  ) -> impl Future<Output = Result<FaceMatchResult, ProviderError>> + Send + '_;
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use rand_core::OsRng;

  use super::*;

  #[test]
  fn assigned_challenges_are_distinct() {
    for count in 0..=8 {
      let picked = assign_challenges(count, &mut OsRng);
      assert_eq!(picked.len(), count.min(LivenessChallenge::ALL.len()));
      let unique: HashSet<_> = picked.iter().collect();
      assert_eq!(unique.len(), picked.len());
    }
  }

  #[test]
  fn only_transient_errors_are_retryable() {
    assert!(ProviderError::Timeout.is_transient());
    assert!(ProviderError::Unavailable("503".into()).is_transient());
    assert!(!ProviderError::Rejected("bad image".into()).is_transient());
    assert!(!ProviderError::Cancelled.is_transient());
  }
}
