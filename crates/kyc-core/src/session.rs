//! The verification session entity and its state machine.
//!
//! A session owns everything about one verification attempt. Its status only
//! moves forward through the stage graph
//!
//! ```text
//! Started → DocumentFrontCaptured → [DocumentBackCaptured] → DocumentProcessing
//!         → AwaitingSelfie → SelfieCaptured → ProcessingBiometrics → Completed
//! ```
//!
//! or sideways into `Failed` / `Expired`. The only way back to `Started` is
//! [`VerificationSession::reset_for_retry`], which consumes an attempt.
//!
//! Status, failure reason and attempt bookkeeping are private: they change
//! only through the transition methods below.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
  Error,
  Result,
  config::VerificationConfig,
  document::{DocumentType, ValidationError, ValidationResult},
  gateway::{
    ChallengeResult, ExtractedFields, FaceMatchResult, LivenessChallenge, LivenessResult,
    OcrResult, ProviderStage,
  },
};

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
  Started,
  DocumentFrontCaptured,
  DocumentBackCaptured,
  DocumentProcessing,
  AwaitingSelfie,
  SelfieCaptured,
  ProcessingBiometrics,
  Completed,
  Failed,
  Expired,
}

impl SessionStatus {
  /// Position along the stage graph; terminal failure states sort last.
  pub fn stage_index(self) -> u8 {
    match self {
      Self::Started => 0,
      Self::DocumentFrontCaptured => 1,
      Self::DocumentBackCaptured => 2,
      Self::DocumentProcessing => 3,
      Self::AwaitingSelfie => 4,
      Self::SelfieCaptured => 5,
      Self::ProcessingBiometrics => 6,
      Self::Completed => 7,
      Self::Failed => 8,
      Self::Expired => 9,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Expired)
  }

  /// A provider call is in flight while the session sits in this state.
  pub fn is_processing(self) -> bool {
    matches!(self, Self::DocumentProcessing | Self::ProcessingBiometrics)
  }

  /// Whether `self → next` is an edge of the stage graph.
  pub fn can_advance_to(self, next: Self, requires_back: bool) -> bool {
    use SessionStatus::*;
    match (self, next) {
      (Completed | Failed | Expired, _) => false,
      (_, Failed | Expired) => true,
      (Started, DocumentFrontCaptured) => true,
      (DocumentFrontCaptured, DocumentBackCaptured) => requires_back,
      (DocumentFrontCaptured, DocumentProcessing) => !requires_back,
      (DocumentBackCaptured, DocumentProcessing) => true,
      (DocumentProcessing, AwaitingSelfie) => true,
      (AwaitingSelfie, SelfieCaptured) => true,
      (SelfieCaptured, ProcessingBiometrics) => true,
      (ProcessingBiometrics, Completed) => true,
      _ => false,
    }
  }
}

// ─── Failure reasons ─────────────────────────────────────────────────────────

/// Why an attempt failed. Every `Failed` session carries exactly one; audit
/// and compliance reporting key off the string form.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureReason {
  BlurryDocument,
  CutOffDocument,
  GlareDetected,
  ExpiredDocument,
  FakeDocument,
  FaceNotDetected,
  FaceMismatch,
  LivenessFailed,
  MultipleAttemptsFailed,
  SessionExpired,
  OcrFailed,
  InvalidDocumentNumber,
  UnderMinimumAge,
  Cancelled,
}

impl FailureReason {
  /// Recoverable failures are retried on the same session record; the rest
  /// need a fresh session (usually with a different document).
  pub fn is_recoverable(self) -> bool {
    !matches!(
      self,
      Self::ExpiredDocument
        | Self::FakeDocument
        | Self::UnderMinimumAge
        | Self::MultipleAttemptsFailed
        | Self::SessionExpired
    )
  }

  /// Short, actionable text the capture UI can show.
  pub fn guidance(self) -> &'static str {
    match self {
      Self::BlurryDocument => "Retake the document photo holding the camera steady.",
      Self::CutOffDocument => "Retake the document photo with all four corners visible.",
      Self::GlareDetected => "Retake the document photo away from direct light; glare detected.",
      Self::ExpiredDocument => "This document has expired. Use a valid document.",
      Self::FakeDocument => "This document could not be verified as genuine.",
      Self::FaceNotDetected => "Make sure your face is clearly visible and well lit.",
      Self::FaceMismatch => "Your selfie did not match the document photo. Try again.",
      Self::LivenessFailed => "Follow the on-screen prompts and keep your face in frame.",
      Self::MultipleAttemptsFailed => "Too many failed attempts. Try again later.",
      Self::SessionExpired => "Your verification session timed out. Start again.",
      Self::OcrFailed => "We could not read your document. Retake the photo.",
      Self::InvalidDocumentNumber => "The document number could not be validated.",
      Self::UnderMinimumAge => "You do not meet the minimum age requirement.",
      Self::Cancelled => "Verification was cancelled.",
    }
  }

  /// The most specific reason for a failed document validation.
  pub fn from_validation(errors: &[ValidationError]) -> Self {
    let has = |e: ValidationError| errors.contains(&e);
    if has(ValidationError::DocumentExpired) {
      Self::ExpiredDocument
    } else if has(ValidationError::UnderMinimumAge) {
      Self::UnderMinimumAge
    } else if has(ValidationError::MissingDocumentNumber)
      || has(ValidationError::InvalidNumberFormat)
      || has(ValidationError::ChecksumMismatch)
    {
      Self::InvalidDocumentNumber
    } else if has(ValidationError::LowOcrConfidence) {
      Self::BlurryDocument
    } else {
      Self::OcrFailed
    }
  }
}

// ─── Components ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
  pub latitude:  f64,
  pub longitude: f64,
}

/// Capture-device metadata, kept for audit only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceContext {
  pub device_info: Option<String>,
  pub ip_address:  Option<String>,
  pub user_agent:  Option<String>,
  pub geo:         Option<GeoPoint>,
}

/// Input for [`VerificationSession::start`].
#[derive(Debug, Clone)]
pub struct NewSession {
  pub user_id:       Uuid,
  pub profile_id:    Option<Uuid>,
  pub document_type: DocumentType,
  pub device:        DeviceContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCapture {
  pub document_type:     DocumentType,
  pub front_image_ref:   Option<String>,
  pub back_image_ref:    Option<String>,
  pub front_processed:   bool,
  pub back_processed:    bool,
  pub front_captured_at: Option<DateTime<Utc>>,
  pub back_captured_at:  Option<DateTime<Utc>>,
}

impl DocumentCapture {
  fn new(document_type: DocumentType) -> Self {
    Self {
      document_type,
      front_image_ref: None,
      back_image_ref: None,
      front_processed: false,
      back_processed: false,
      front_captured_at: None,
      back_captured_at: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutcome {
  pub fields:       ExtractedFields,
  pub confidence:   f64,
  pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessOutcome {
  /// Challenges assigned to this attempt, in the order they are requested.
  pub challenges: Vec<LivenessChallenge>,
  pub results:    Vec<ChallengeResult>,
  pub passed:     bool,
  pub score:      f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceMatchOutcome {
  pub score:           f64,
  /// Threshold the decision was made against.
  pub threshold:       f64,
  pub passed:          bool,
  /// Score reached the configured high-confidence level.
  pub high_confidence: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentValidation {
  pub passed: bool,
  pub errors: Vec<ValidationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderLinkage {
  pub provider_name: Option<String>,
  pub session_ref:   Option<String>,
  /// Verbatim provider payloads keyed by stage.
  pub raw_responses: BTreeMap<ProviderStage, serde_json::Value>,
}

/// What a failed attempt looked like before a retry reset it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
  pub attempt_number: u32,
  pub failure_reason: Option<FailureReason>,
  pub failure_detail: Option<String>,
  pub ended_at:       Option<DateTime<Utc>>,
  pub raw_responses:  BTreeMap<ProviderStage, serde_json::Value>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
  pub session_id:          Uuid,
  pub user_id:             Uuid,
  pub profile_id:          Option<Uuid>,
  /// Set when a retry spawned this session from a failed one.
  pub previous_session_id: Option<Uuid>,

  status:         SessionStatus,
  failure_reason: Option<FailureReason>,
  failure_detail: Option<String>,

  pub document:   DocumentCapture,
  pub ocr:        OcrOutcome,
  pub liveness:   LivenessOutcome,
  pub face_match: FaceMatchOutcome,
  pub validation: DocumentValidation,

  pub overall_score: f64,

  attempt_number:  u32,
  max_attempts:    u32,
  attempt_history: Vec<AttemptSummary>,

  pub device:   DeviceContext,
  pub provider: ProviderLinkage,

  pub created_at:         DateTime<Utc>,
  pub selfie_captured_at: Option<DateTime<Utc>>,
  pub completed_at:       Option<DateTime<Utc>>,
  pub expires_at:         DateTime<Utc>,

  /// Optimistic-concurrency counter; bumped on every persisted change.
  pub version: u64,
}

impl VerificationSession {
  /// Create a session for a user beginning verification.
  pub fn start(
    new: NewSession,
    config: &VerificationConfig,
    challenges: Vec<LivenessChallenge>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      session_id: Uuid::new_v4(),
      user_id: new.user_id,
      profile_id: new.profile_id,
      previous_session_id: None,
      status: SessionStatus::Started,
      failure_reason: None,
      failure_detail: None,
      document: DocumentCapture::new(new.document_type),
      ocr: OcrOutcome::default(),
      liveness: LivenessOutcome { challenges, ..Default::default() },
      face_match: FaceMatchOutcome {
        threshold: config.face_match_threshold,
        ..Default::default()
      },
      validation: DocumentValidation::default(),
      overall_score: 0.0,
      attempt_number: 1,
      max_attempts: config.max_attempts,
      attempt_history: Vec::new(),
      device: new.device,
      provider: ProviderLinkage::default(),
      created_at: now,
      selfie_captured_at: None,
      completed_at: None,
      expires_at: now + config.session_ttl(),
      version: 0,
    }
  }

  /// Spawn a fresh session after a non-recoverable failure of `previous`.
  ///
  /// The new session gets its own TTL but continues the attempt count so the
  /// per-user limit still applies.
  pub fn spawn_retry(
    previous: &Self,
    document_type: DocumentType,
    config: &VerificationConfig,
    challenges: Vec<LivenessChallenge>,
    now: DateTime<Utc>,
  ) -> Result<Self> {
    previous.ensure_retryable(now)?;
    let mut next = Self::start(
      NewSession {
        user_id: previous.user_id,
        profile_id: previous.profile_id,
        document_type,
        device: previous.device.clone(),
      },
      config,
      challenges,
      now,
    );
    next.previous_session_id = Some(previous.session_id);
    next.attempt_number = previous.attempt_number + 1;
    next.max_attempts = previous.max_attempts;
    next.attempt_history = previous.attempt_history.clone();
    next.attempt_history.push(previous.summary());
    Ok(next)
  }

  // ── Accessors ─────────────────────────────────────────────────────────────

  pub fn status(&self) -> SessionStatus { self.status }

  pub fn failure_reason(&self) -> Option<FailureReason> { self.failure_reason }

  pub fn failure_detail(&self) -> Option<&str> { self.failure_detail.as_deref() }

  pub fn attempt_number(&self) -> u32 { self.attempt_number }

  pub fn max_attempts(&self) -> u32 { self.max_attempts }

  pub fn attempt_history(&self) -> &[AttemptSummary] { &self.attempt_history }

  pub fn requires_back(&self) -> bool { self.document.document_type.requires_back() }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now > self.expires_at }

  /// The status a reader should see: a stale non-terminal session reads as
  /// `Expired` even before a sweep has persisted it.
  pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
    if !self.status.is_terminal() && self.is_expired(now) {
      SessionStatus::Expired
    } else {
      self.status
    }
  }

  pub fn can_retry(&self) -> bool {
    self.attempt_number < self.max_attempts && self.status == SessionStatus::Failed
  }

  /// No further change can ever happen to this session.
  pub fn is_final(&self) -> bool {
    match self.status {
      SessionStatus::Completed | SessionStatus::Expired => true,
      SessionStatus::Failed => !self.can_retry(),
      _ => false,
    }
  }

  /// All three gates passed independently.
  pub fn gates_passed(&self) -> bool {
    self.validation.passed && self.liveness.passed && self.face_match.passed
  }

  /// Stage operations are allowed only on live, non-terminal sessions.
  pub fn ensure_active(&self, now: DateTime<Utc>) -> Result<()> {
    if self.is_expired(now) || self.status == SessionStatus::Expired {
      return Err(Error::SessionExpired(self.session_id));
    }
    if self.status.is_terminal() {
      return Err(Error::SessionTerminal(self.session_id, self.status));
    }
    Ok(())
  }

  fn ensure_retryable(&self, now: DateTime<Utc>) -> Result<()> {
    if self.is_expired(now) || self.status == SessionStatus::Expired {
      return Err(Error::SessionExpired(self.session_id));
    }
    if !self.can_retry() {
      return Err(Error::RetryNotAllowed {
        attempt: self.attempt_number,
        max:     self.max_attempts,
        status:  self.status,
      });
    }
    Ok(())
  }

  /// Whether this attempt was the last one permitted.
  pub fn attempts_exhausted(&self) -> bool {
    self.status == SessionStatus::Failed && self.attempt_number >= self.max_attempts
  }

  fn advance(&mut self, next: SessionStatus) -> Result<()> {
    if !self.status.can_advance_to(next, self.requires_back()) {
      return Err(Error::IllegalTransition { from: self.status, to: next });
    }
    self.status = next;
    Ok(())
  }

  fn summary(&self) -> AttemptSummary {
    AttemptSummary {
      attempt_number: self.attempt_number,
      failure_reason: self.failure_reason,
      failure_detail: self.failure_detail.clone(),
      ended_at:       self.completed_at,
      raw_responses:  self.provider.raw_responses.clone(),
    }
  }

  fn record_provider(
    &mut self,
    stage: ProviderStage,
    provider: &str,
    session_ref: Option<&str>,
    raw: &serde_json::Value,
  ) {
    self.provider.provider_name = Some(provider.to_owned());
    if let Some(r) = session_ref {
      self.provider.session_ref = Some(r.to_owned());
    }
    self.provider.raw_responses.insert(stage, raw.clone());
  }

  // ── Document stage ────────────────────────────────────────────────────────

  pub fn record_front(&mut self, image_ref: String, now: DateTime<Utc>) -> Result<()> {
    self.advance(SessionStatus::DocumentFrontCaptured)?;
    self.document.front_image_ref = Some(image_ref);
    self.document.front_captured_at = Some(now);
    Ok(())
  }

  pub fn record_back(&mut self, image_ref: String, now: DateTime<Utc>) -> Result<()> {
    if !self.requires_back() {
      return Err(Error::NoBackSide(self.document.document_type));
    }
    self.advance(SessionStatus::DocumentBackCaptured)?;
    self.document.back_image_ref = Some(image_ref);
    self.document.back_captured_at = Some(now);
    Ok(())
  }

  pub fn begin_document_processing(&mut self) -> Result<()> {
    self.advance(SessionStatus::DocumentProcessing)
  }

  /// Store what OCR extracted. Does not move the session.
  pub fn apply_ocr(&mut self, result: &OcrResult, provider: &str, now: DateTime<Utc>) {
    self.ocr = OcrOutcome {
      fields:       result.fields.clone(),
      confidence:   crate::score::clamp_score(result.confidence),
      processed_at: Some(now),
    };
    self.document.front_processed = true;
    self.document.back_processed = self.document.back_image_ref.is_some();
    self.record_provider(
      ProviderStage::Ocr,
      provider,
      result.provider_session_id.as_deref(),
      &result.raw_response,
    );
  }

  pub fn apply_validation(&mut self, result: &ValidationResult) {
    self.validation = DocumentValidation {
      passed: result.is_valid,
      errors: result.errors.clone(),
    };
  }

  /// OCR produced usable fields below the confidence threshold.
  pub fn flag_low_confidence(&mut self) {
    self.validation.passed = false;
    if !self.validation.errors.contains(&ValidationError::LowOcrConfidence) {
      self.validation.errors.push(ValidationError::LowOcrConfidence);
    }
  }

  pub fn accept_document(&mut self) -> Result<()> {
    if !self.validation.passed {
      return Err(Error::GateNotPassed("document validation"));
    }
    self.advance(SessionStatus::AwaitingSelfie)
  }

  // ── Biometric stage ───────────────────────────────────────────────────────

  pub fn record_selfie(&mut self, now: DateTime<Utc>) -> Result<()> {
    self.advance(SessionStatus::SelfieCaptured)?;
    self.selfie_captured_at = Some(now);
    Ok(())
  }

  pub fn begin_biometrics(&mut self) -> Result<()> {
    self.advance(SessionStatus::ProcessingBiometrics)
  }

  /// Decide the liveness gate. Besides the provider's verdict and the score,
  /// every challenge assigned to this attempt needs a passed result.
  pub fn apply_liveness(&mut self, result: &LivenessResult, min_score: f64, provider: &str) {
    let score = crate::score::clamp_score(result.score);
    let all_performed = self.liveness.challenges.iter().all(|assigned| {
      result
        .challenges
        .iter()
        .any(|r| r.challenge == *assigned && r.passed)
    });
    self.liveness.results = result.challenges.clone();
    self.liveness.score = score;
    self.liveness.passed = result.passed && score >= min_score && all_performed;
    self.record_provider(
      ProviderStage::Liveness,
      provider,
      result.provider_session_id.as_deref(),
      &result.raw_response,
    );
  }

  /// Decide the face gate against the session's own threshold; a score equal
  /// to the threshold passes.
  pub fn apply_face_match(
    &mut self,
    result: &FaceMatchResult,
    high_confidence: f64,
    provider: &str,
  ) {
    let score = crate::score::clamp_score(result.match_score);
    let detected = result.face_detected_in_document && result.face_detected_in_selfie;
    self.face_match.score = score;
    self.face_match.passed = result.success && detected && score >= self.face_match.threshold;
    self.face_match.high_confidence = self.face_match.passed && score >= high_confidence;
    self.record_provider(
      ProviderStage::FaceMatch,
      provider,
      result.provider_session_id.as_deref(),
      &result.raw_response,
    );
  }

  /// Reason the biometric gates failed, if they did.
  pub fn biometric_failure(&self, face: &FaceMatchResult) -> Option<FailureReason> {
    if !self.liveness.passed {
      Some(FailureReason::LivenessFailed)
    } else if !face.face_detected_in_document || !face.face_detected_in_selfie {
      Some(FailureReason::FaceNotDetected)
    } else if !self.face_match.passed {
      Some(FailureReason::FaceMismatch)
    } else {
      None
    }
  }

  // ── Terminal transitions ──────────────────────────────────────────────────

  pub fn complete(&mut self, overall_score: f64, now: DateTime<Utc>) -> Result<()> {
    if !self.gates_passed() {
      return Err(Error::GateNotPassed("biometrics"));
    }
    self.advance(SessionStatus::Completed)?;
    self.overall_score = overall_score;
    self.completed_at = Some(now);
    Ok(())
  }

  pub fn fail(
    &mut self,
    reason: FailureReason,
    detail: Option<String>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    self.advance(SessionStatus::Failed)?;
    self.failure_reason = Some(reason);
    self.failure_detail = detail;
    self.overall_score = 0.0;
    self.completed_at = Some(now);
    Ok(())
  }

  pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
    self.advance(SessionStatus::Expired)?;
    self.failure_reason = Some(FailureReason::SessionExpired);
    self.failure_detail = None;
    self.overall_score = 0.0;
    self.completed_at = Some(now);
    Ok(())
  }

  /// Reuse this session for another attempt. Same id, same expiry; stage
  /// data is cleared and the failed attempt is archived.
  pub fn reset_for_retry(
    &mut self,
    challenges: Vec<LivenessChallenge>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    self.ensure_retryable(now)?;
    self.attempt_history.push(self.summary());
    self.attempt_number += 1;
    self.status = SessionStatus::Started;
    self.failure_reason = None;
    self.failure_detail = None;
    self.document = DocumentCapture::new(self.document.document_type);
    self.ocr = OcrOutcome::default();
    self.liveness = LivenessOutcome { challenges, ..Default::default() };
    self.face_match = FaceMatchOutcome {
      threshold: self.face_match.threshold,
      ..Default::default()
    };
    self.validation = DocumentValidation::default();
    self.overall_score = 0.0;
    self.provider.raw_responses.clear();
    self.selfie_captured_at = None;
    self.completed_at = None;
    Ok(())
  }
}
