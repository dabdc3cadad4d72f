//! Request-level guard records: idempotency markers and rate-limit windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

// ─── Idempotency ─────────────────────────────────────────────────────────────

/// Identifies one logical client request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
  /// Client-supplied token.
  pub key:     String,
  pub user_id: Uuid,
  pub method:  String,
  pub path:    String,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyState {
  Processing,
  Completed,
}

/// The first response produced for a key, replayed to duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status_code: u16,
  pub body:        serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
  pub key:         IdempotencyKey,
  /// Hex digest of the request body; a reused key with a different body is
  /// refused rather than replayed.
  pub fingerprint: String,
  pub state:       IdempotencyState,
  pub response:    Option<StoredResponse>,
  pub created_at:  DateTime<Utc>,
  pub expires_at:  DateTime<Utc>,
}

impl IdempotencyRecord {
  /// A claim on `key` held for `lease`. An owner that dies without
  /// completing or releasing it loses the key once the lease runs out.
  pub fn processing(
    key: IdempotencyKey,
    fingerprint: String,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Self {
    Self {
      key,
      fingerprint,
      state: IdempotencyState::Processing,
      response: None,
      created_at: now,
      expires_at: now + lease,
    }
  }

  pub fn is_processing(&self) -> bool { self.state == IdempotencyState::Processing }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now >= self.expires_at }
}

/// Result of trying to claim a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
  /// The caller owns the key and must complete or release it.
  Claimed,
  /// A live record already exists.
  Existing(IdempotencyRecord),
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
  pub subject:  String,
  pub endpoint: String,
}

/// A fixed counting window for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
  pub key:          RateLimitKey,
  pub count:        u64,
  pub window_start: DateTime<Utc>,
  pub window_end:   DateTime<Utc>,
}

impl RateLimitWindow {
  pub fn exceeds(&self, max_requests: u64) -> bool { self.count > max_requests }

  /// Time until the window resets, rounded up to whole seconds.
  pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
    let remaining = self.window_end - now;
    let ms = remaining.num_milliseconds().max(0);
    u64::try_from((ms + 999) / 1000).unwrap_or(0)
  }
}
