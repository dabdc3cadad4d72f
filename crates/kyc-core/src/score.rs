//! Overall confidence score for a verification attempt.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, session::VerificationSession};

/// Relative weight of each sub-score. Loaded from configuration so that a
/// jurisdiction can retune without a code change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
  pub ocr:        f64,
  pub liveness:   f64,
  pub face_match: f64,
}

impl Default for ScoreWeights {
  fn default() -> Self { Self { ocr: 0.4, liveness: 0.3, face_match: 0.3 } }
}

impl ScoreWeights {
  /// Weights must be finite, non-negative and sum to one.
  pub fn validate(&self) -> Result<()> {
    let all = [self.ocr, self.liveness, self.face_match];
    if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
      return Err(Error::InvalidConfig(
        "score weights must be finite and non-negative".into(),
      ));
    }
    let sum: f64 = all.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
      return Err(Error::InvalidConfig(format!(
        "score weights must sum to 1, got {sum}"
      )));
    }
    Ok(())
  }
}

/// Combines OCR, liveness and face-match sub-scores into one figure in
/// `[0, 100]`.
///
/// Pure and deterministic; the same calculator is used live and when
/// re-scoring stored sessions for audit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreCalculator {
  weights: ScoreWeights,
}

impl ScoreCalculator {
  pub fn new(weights: ScoreWeights) -> Self { Self { weights } }

  pub fn weights(&self) -> ScoreWeights { self.weights }

  /// An unpassed gate always yields zero, whatever the sub-scores are.
  pub fn compute(
    &self,
    ocr_confidence: f64,
    liveness_score: f64,
    face_match_score: f64,
    all_gates_passed: bool,
  ) -> f64 {
    if !all_gates_passed {
      return 0.0;
    }
    let w = self.weights;
    let overall = w.ocr * clamp_score(ocr_confidence)
      + w.liveness * clamp_score(liveness_score)
      + w.face_match * clamp_score(face_match_score);
    clamp_score(overall)
  }

  /// Score a session from the sub-scores and gates recorded on it.
  pub fn score_session(&self, session: &VerificationSession) -> f64 {
    self.compute(
      session.ocr.confidence,
      session.liveness.score,
      session.face_match.score,
      session.gates_passed(),
    )
  }
}

/// Clamp into `[0, 100]`, mapping NaN to zero.
pub fn clamp_score(value: f64) -> f64 {
  if value.is_nan() { 0.0 } else { value.clamp(0.0, 100.0) }
}
