//! Error type for `kyc-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value no domain type decodes from.
  #[error("unrecognised {column} value: {value:?}")]
  UnknownValue { column: &'static str, value: String },

  #[error("session not found: {0}")]
  SessionNotFound(uuid::Uuid),

  #[error("saga not found: {0}")]
  SagaNotFound(uuid::Uuid),

  #[error("no idempotency record for key {0:?}")]
  IdempotencyKeyNotFound(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
