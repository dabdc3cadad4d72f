//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Filter-column timestamps are fixed-width RFC 3339 with microseconds and a
//! `Z` suffix. Enums are stored by their snake_case name. UUIDs are stored as
//! hyphenated lowercase strings.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use kyc_core::{
  request::{
    IdempotencyKey, IdempotencyRecord, IdempotencyState, RateLimitKey, RateLimitWindow,
    StoredResponse,
  },
  saga::ProvisioningSagaState,
  session::VerificationSession,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enums ───────────────────────────────────────────────────────────────────

pub fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| Error::UnknownValue { column, value: s.to_owned() })
}

// ─── Versions ────────────────────────────────────────────────────────────────

// SQLite integers are signed; versions never get near the limit.
pub fn encode_version(version: u64) -> i64 { i64::try_from(version).unwrap_or(i64::MAX) }

// ─── Bodies ──────────────────────────────────────────────────────────────────

pub fn encode_session(session: &VerificationSession) -> Result<String> {
  Ok(serde_json::to_string(session)?)
}

pub fn decode_session(s: &str) -> Result<VerificationSession> { Ok(serde_json::from_str(s)?) }

pub fn encode_saga(saga: &ProvisioningSagaState) -> Result<String> {
  Ok(serde_json::to_string(saga)?)
}

pub fn decode_saga(s: &str) -> Result<ProvisioningSagaState> { Ok(serde_json::from_str(s)?) }

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from an `idempotency_records` row.
pub struct RawIdempotency {
  pub idem_key:      String,
  pub user_id:       String,
  pub method:        String,
  pub path:          String,
  pub fingerprint:   String,
  pub state:         String,
  pub status_code:   Option<i64>,
  pub response_body: Option<String>,
  pub created_at:    String,
  pub expires_at:    String,
}

impl RawIdempotency {
  pub const COLUMNS: &'static str = "idem_key, user_id, method, path, fingerprint, state, \
                                     status_code, response_body, created_at, expires_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      idem_key:      row.get(0)?,
      user_id:       row.get(1)?,
      method:        row.get(2)?,
      path:          row.get(3)?,
      fingerprint:   row.get(4)?,
      state:         row.get(5)?,
      status_code:   row.get(6)?,
      response_body: row.get(7)?,
      created_at:    row.get(8)?,
      expires_at:    row.get(9)?,
    })
  }

  pub fn into_record(self) -> Result<IdempotencyRecord> {
    let response = match (self.status_code, self.response_body) {
      (Some(code), Some(body)) => Some(StoredResponse {
        status_code: u16::try_from(code).map_err(|_| Error::UnknownValue {
          column: "status_code",
          value:  code.to_string(),
        })?,
        body:        serde_json::from_str(&body)?,
      }),
      _ => None,
    };
    Ok(IdempotencyRecord {
      key: IdempotencyKey {
        key:     self.idem_key,
        user_id: decode_uuid(&self.user_id)?,
        method:  self.method,
        path:    self.path,
      },
      fingerprint: self.fingerprint,
      state: decode_enum::<IdempotencyState>("state", &self.state)?,
      response,
      created_at: decode_dt(&self.created_at)?,
      expires_at: decode_dt(&self.expires_at)?,
    })
  }
}

/// Raw values returned by the rate-limit upsert.
pub struct RawWindow {
  pub count:        i64,
  pub window_start: String,
  pub window_end:   String,
}

impl RawWindow {
  pub fn into_window(self, key: RateLimitKey) -> Result<RateLimitWindow> {
    Ok(RateLimitWindow {
      key,
      count: u64::try_from(self.count).unwrap_or(0),
      window_start: decode_dt(&self.window_start)?,
      window_end: decode_dt(&self.window_end)?,
    })
  }
}
