//! Tunables for the verification core.
//!
//! Values come from the enclosing deployment (the `kyc` binary reads them
//! from `config.toml` and `KYC__*` environment variables); every field has a
//! default so partial configuration files are accepted.

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
  Error,
  Result,
  capture::ImagePolicy,
  document::{DocumentType, JurisdictionRules},
  score::ScoreWeights,
};

/// Per-stage provider call timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
  pub ocr_ms:        u64,
  pub liveness_ms:   u64,
  pub face_match_ms: u64,
}

impl Default for StageTimeouts {
  fn default() -> Self {
    Self { ocr_ms: 30_000, liveness_ms: 30_000, face_match_ms: 20_000 }
  }
}

impl StageTimeouts {
  pub fn ocr(&self) -> StdDuration { StdDuration::from_millis(self.ocr_ms) }

  pub fn liveness(&self) -> StdDuration { StdDuration::from_millis(self.liveness_ms) }

  pub fn face_match(&self) -> StdDuration {
    StdDuration::from_millis(self.face_match_ms)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyPolicy {
  /// How long a completed response is replayed.
  pub ttl_hours:           u32,
  /// How long an unfinished claim blocks the key. Must outlast the slowest
  /// handler.
  pub processing_lease_ms: u64,
  /// How long a duplicate waits for the original request before giving up
  /// with "retry later".
  pub wait_ms:             u64,
  pub poll_interval_ms:    u64,
}

impl Default for IdempotencyPolicy {
  fn default() -> Self {
    Self {
      ttl_hours:           24,
      processing_lease_ms: 120_000,
      wait_ms:             2_000,
      poll_interval_ms:    50,
    }
  }
}

impl IdempotencyPolicy {
  pub fn ttl(&self) -> Duration { Duration::hours(i64::from(self.ttl_hours)) }

  pub fn processing_lease(&self) -> Duration {
    Duration::milliseconds(i64::try_from(self.processing_lease_ms).unwrap_or(i64::MAX))
  }
}

/// Fixed-window quota applied per (subject, endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
  pub max_requests:   u64,
  pub window_seconds: u32,
}

impl Default for RateLimitPolicy {
  fn default() -> Self { Self { max_requests: 20, window_seconds: 60 } }
}

impl RateLimitPolicy {
  pub fn window(&self) -> Duration { Duration::seconds(i64::from(self.window_seconds)) }
}

/// Everything the verification core can be tuned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
  pub session_ttl_minutes:        u32,
  pub max_attempts:               u32,
  pub cooldown_hours:             u32,
  pub face_match_threshold:       f64,
  pub face_match_high_confidence: f64,
  pub liveness_challenge_count:   usize,
  pub liveness_min_score:         f64,
  pub ocr_confidence_threshold:   f64,
  pub allowed_document_types:     Vec<DocumentType>,
  /// How many times a transient provider failure is retried at the same
  /// stage before the attempt fails.
  pub provider_retries:           u32,
  pub images:                     ImagePolicy,
  /// How long captured images of finished sessions are kept.
  pub image_retention_hours:      u32,
  pub score_weights:              ScoreWeights,
  pub jurisdiction:               JurisdictionRules,
  pub timeouts:                   StageTimeouts,
  pub idempotency:                IdempotencyPolicy,
  pub rate_limit:                 RateLimitPolicy,
}

impl Default for VerificationConfig {
  fn default() -> Self {
    Self {
      session_ttl_minutes:        30,
      max_attempts:               3,
      cooldown_hours:             24,
      face_match_threshold:       80.0,
      face_match_high_confidence: 95.0,
      liveness_challenge_count:   3,
      liveness_min_score:         70.0,
      ocr_confidence_threshold:   70.0,
      allowed_document_types:     vec![
        DocumentType::Passport,
        DocumentType::NationalIdCard,
        DocumentType::DriversLicense,
        DocumentType::ResidencePermit,
      ],
      provider_retries:           2,
      images:                     ImagePolicy::default(),
      image_retention_hours:      72,
      score_weights:              ScoreWeights::default(),
      jurisdiction:               JurisdictionRules::default(),
      timeouts:                   StageTimeouts::default(),
      idempotency:                IdempotencyPolicy::default(),
      rate_limit:                 RateLimitPolicy::default(),
    }
  }
}

impl VerificationConfig {
  pub fn session_ttl(&self) -> Duration {
    Duration::minutes(i64::from(self.session_ttl_minutes))
  }

  pub fn cooldown(&self) -> Duration { Duration::hours(i64::from(self.cooldown_hours)) }

  pub fn image_retention(&self) -> Duration {
    Duration::hours(i64::from(self.image_retention_hours))
  }

  pub fn accepts(&self, document_type: DocumentType) -> bool {
    self.allowed_document_types.contains(&document_type)
  }

  /// Reject configurations the core cannot operate under.
  pub fn validate(&self) -> Result<()> {
    if self.session_ttl_minutes == 0 {
      return Err(Error::InvalidConfig("session_ttl_minutes must be positive".into()));
    }
    if self.max_attempts == 0 {
      return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
    }
    for (name, value) in [
      ("face_match_threshold", self.face_match_threshold),
      ("face_match_high_confidence", self.face_match_high_confidence),
      ("liveness_min_score", self.liveness_min_score),
      ("ocr_confidence_threshold", self.ocr_confidence_threshold),
    ] {
      if !(0.0..=100.0).contains(&value) {
        return Err(Error::InvalidConfig(format!("{name} must be within 0..=100")));
      }
    }
    if self.face_match_high_confidence < self.face_match_threshold {
      return Err(Error::InvalidConfig(
        "face_match_high_confidence must not be below face_match_threshold".into(),
      ));
    }
    if self.allowed_document_types.is_empty() {
      return Err(Error::InvalidConfig("no document types are allowed".into()));
    }
    if self.images.allowed_formats.is_empty() || self.images.min_bytes > self.images.max_bytes
    {
      return Err(Error::InvalidConfig("image policy admits no image".into()));
    }
    if self.idempotency.processing_lease_ms == 0 {
      return Err(Error::InvalidConfig(
        "idempotency.processing_lease_ms must be positive".into(),
      ));
    }
    if self.rate_limit.window_seconds == 0 {
      return Err(Error::InvalidConfig("rate_limit.window_seconds must be positive".into()));
    }
    self.score_weights.validate()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = VerificationConfig::default();
    config.validate().unwrap();
    assert_eq!(config.session_ttl(), Duration::minutes(30));
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.cooldown(), Duration::hours(24));
    assert_eq!(config.face_match_threshold, 80.0);
    assert!(config.idempotency.processing_lease() < config.idempotency.ttl());
  }

  #[test]
  fn partial_json_fills_defaults() {
    let config: VerificationConfig =
      serde_json::from_str(r#"{ "max_attempts": 5, "timeouts": { "ocr_ms": 10 } }"#)
        .unwrap();
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.timeouts.ocr_ms, 10);
    assert_eq!(config.timeouts.liveness_ms, 30_000);
    assert_eq!(config.session_ttl_minutes, 30);
  }

  #[test]
  fn out_of_range_thresholds_are_rejected() {
    let config = VerificationConfig { face_match_threshold: 120.0, ..Default::default() };
    assert!(config.validate().is_err());
  }

  #[test]
  fn zero_processing_lease_is_rejected() {
    let mut config = VerificationConfig::default();
    config.idempotency.processing_lease_ms = 0;
    assert!(config.validate().is_err());
  }
}
