//! Storage traits for sessions, sagas and request guards.
//!
//! The traits are implemented by storage backends (e.g. `kyc-store-sqlite`).
//! The engine depends on these abstractions, not on any concrete backend.
//!
//! Every state-changing write of a session or saga is version-checked: the
//! caller passes the version it loaded, and the backend applies the write
//! only if the stored version still matches. State and extracted data are
//! written together in that single statement.

use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
  capture::ImageFormat,
  request::{
    BeginOutcome, IdempotencyKey, IdempotencyRecord, RateLimitKey, RateLimitWindow,
    StoredResponse,
  },
  saga::{ProvisioningSagaState, SagaStatus},
  session::VerificationSession,
};

/// Result of a version-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Applied,
  /// Someone else wrote first; reload and decide again.
  VersionConflict,
}

/// Which capture an image belongs to.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageSlot {
  DocumentFront,
  DocumentBack,
  Selfie,
}

/// Image bytes retained so later stages (face comparison) can reuse them.
#[derive(Debug, Clone)]
pub struct StoredImage {
  pub reference:   String,
  pub session_id:  Uuid,
  pub slot:        ImageSlot,
  pub format:      ImageFormat,
  pub bytes:       Bytes,
  pub captured_at: DateTime<Utc>,
}

// ─── Sessions ────────────────────────────────────────────────────────────────

pub trait SessionStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn insert_session(
    &self,
    session: VerificationSession,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Retrieve a session by id. Returns `None` if not found.
  fn get_session(
    &self,
    session_id: Uuid,
  ) -> impl Future<Output = Result<Option<VerificationSession>, Self::Error>> + Send + '_;

  /// Replace the stored session if its version is still `expected_version`.
  fn save_session(
    &self,
    session: VerificationSession,
    expected_version: u64,
  ) -> impl Future<Output = Result<WriteOutcome, Self::Error>> + Send + '_;

  fn list_sessions_for_user(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Vec<VerificationSession>, Self::Error>> + Send + '_;

  /// Non-terminal sessions whose expiry is before `now`.
  fn list_stale_sessions(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<VerificationSession>, Self::Error>> + Send + '_;

  fn put_image(
    &self,
    image: StoredImage,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_image(
    &self,
    reference: String,
  ) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send + '_;

  /// Drop every image captured for `session_id`; returns how many went.
  fn delete_images(
    &self,
    session_id: Uuid,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Drop images of terminal sessions captured before `captured_before`.
  fn purge_images(
    &self,
    captured_before: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// End of the user's retry cooldown, if one was ever set.
  fn get_cooldown(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_;

  fn set_cooldown(
    &self,
    user_id: Uuid,
    until: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

// ─── Sagas ───────────────────────────────────────────────────────────────────

pub trait SagaStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn insert_saga(
    &self,
    saga: ProvisioningSagaState,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Save a completed `session` and insert its `Started` saga as one
  /// transaction. The session write is version-checked like
  /// [`SessionStore::save_session`]; on conflict neither row is written.
  fn complete_with_saga(
    &self,
    session: VerificationSession,
    expected_version: u64,
    saga: ProvisioningSagaState,
  ) -> impl Future<Output = Result<WriteOutcome, Self::Error>> + Send + '_;

  fn get_saga(
    &self,
    correlation_id: Uuid,
  ) -> impl Future<Output = Result<Option<ProvisioningSagaState>, Self::Error>> + Send + '_;

  fn save_saga(
    &self,
    saga: ProvisioningSagaState,
    expected_version: u64,
  ) -> impl Future<Output = Result<WriteOutcome, Self::Error>> + Send + '_;

  fn saga_for_session(
    &self,
    session_id: Uuid,
  ) -> impl Future<Output = Result<Option<ProvisioningSagaState>, Self::Error>> + Send + '_;

  fn list_sagas(
    &self,
    status: Option<SagaStatus>,
  ) -> impl Future<Output = Result<Vec<ProvisioningSagaState>, Self::Error>> + Send + '_;
}

// ─── Request guards ──────────────────────────────────────────────────────────

pub trait IdempotencyStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Atomically claim `record.key` with a `Processing` marker. An expired
  /// record under the same key is replaced.
  fn try_begin(
    &self,
    record: IdempotencyRecord,
  ) -> impl Future<Output = Result<BeginOutcome, Self::Error>> + Send + '_;

  fn get_record(
    &self,
    key: IdempotencyKey,
  ) -> impl Future<Output = Result<Option<IdempotencyRecord>, Self::Error>> + Send + '_;

  /// Store the response for a claimed key and keep it until `expires_at`.
  fn complete(
    &self,
    key: IdempotencyKey,
    response: StoredResponse,
    expires_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Drop a `Processing` marker so the request can be attempted again.
  fn release(
    &self,
    key: IdempotencyKey,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Delete expired records; returns how many were removed.
  fn purge_expired(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}

pub trait RateLimitStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Atomically count one request against `key` and return the window it
  /// landed in. A window that ended before `now` is restarted.
  fn hit(
    &self,
    key: RateLimitKey,
    now: DateTime<Utc>,
    window: Duration,
  ) -> impl Future<Output = Result<RateLimitWindow, Self::Error>> + Send + '_;
}
